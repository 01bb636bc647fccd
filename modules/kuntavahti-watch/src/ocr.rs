//! OCR fallback for scanned PDFs: render pages with pdftoppm, read them
//! with Tesseract's Finnish model. Both tools run as external processes.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

/// Whole-file OCR budget.
const OCR_TIMEOUT: Duration = Duration::from_secs(300);
/// Render resolution; 200 dpi keeps Tesseract accurate without huge pages.
const RENDER_DPI: &str = "200";

/// OCR a PDF into plain text. Fails if the external tools are missing, a
/// page refuses to render, or the time budget runs out.
pub async fn ocr_pdf(pdf_path: &Path) -> Result<String> {
    tokio::time::timeout(OCR_TIMEOUT, run_ocr(pdf_path))
        .await
        .map_err(|_| anyhow!("OCR timed out after {}s for {}", OCR_TIMEOUT.as_secs(), pdf_path.display()))?
}

async fn run_ocr(pdf_path: &Path) -> Result<String> {
    let workdir = tempfile::tempdir().context("failed to create OCR temp dir")?;
    let prefix = workdir.path().join("page");

    let render = Command::new("pdftoppm")
        .args(["-r", RENDER_DPI, "-png"])
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await
        .context("failed to run pdftoppm (is poppler installed?)")?;
    if !render.status.success() {
        let stderr = String::from_utf8_lossy(&render.stderr);
        return Err(anyhow!("pdftoppm failed for {}: {stderr}", pdf_path.display()));
    }

    let mut pages: Vec<std::path::PathBuf> = std::fs::read_dir(workdir.path())
        .context("failed to list rendered pages")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect();
    pages.sort();
    if pages.is_empty() {
        return Err(anyhow!("pdftoppm produced no pages for {}", pdf_path.display()));
    }

    let mut parts: Vec<String> = Vec::new();
    for page in &pages {
        let output = Command::new("tesseract")
            .arg(page)
            .args(["stdout", "-l", "fin"])
            .output()
            .await
            .context("failed to run tesseract (is it installed with the fin pack?)")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(page = %page.display(), stderr = %stderr, "Tesseract failed on page");
            continue;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if parts.is_empty() {
        return Err(anyhow!("OCR produced no text for {}", pdf_path.display()));
    }

    info!(
        pdf = %pdf_path.display(),
        pages = pages.len(),
        chars = parts.iter().map(String::len).sum::<usize>(),
        "OCR complete"
    );
    Ok(parts.join("\n\n"))
}
