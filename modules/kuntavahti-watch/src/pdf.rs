//! Text-first PDF extraction. Scanned documents yield next to nothing here
//! and fall through to OCR.

use std::path::Path;

use anyhow::{Context, Result};

/// Text a multi-page PDF must reach before we trust the embedded layer.
const MIN_TEXT_CHARS: usize = 100;

pub struct ExtractedPdf {
    pub text: String,
    pub page_count: usize,
}

/// Pull the embedded text layer out of a PDF, page by page.
pub fn extract_pdf_text(path: &Path) -> Result<ExtractedPdf> {
    let doc = lopdf::Document::load(path)
        .with_context(|| format!("failed to load PDF {}", path.display()))?;
    let pages = doc.get_pages();
    let page_count = pages.len();

    let mut parts: Vec<String> = Vec::new();
    for (page_num, _) in pages {
        match doc.extract_text(&[page_num]) {
            Ok(text) if !text.trim().is_empty() => parts.push(text.trim().to_string()),
            _ => {}
        }
    }

    Ok(ExtractedPdf {
        text: parts.join("\n\n"),
        page_count,
    })
}

/// A multi-page PDF with almost no text layer is a scan.
pub fn needs_ocr(text: &str, page_count: usize) -> bool {
    page_count > 1 && text.trim().chars().count() < MIN_TEXT_CHARS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_on_multi_page_pdf_triggers_ocr() {
        let text = "KUNNANHALLITUS 2025 sivu"; // scanner residue, 24 chars
        assert!(text.chars().count() < 100);
        assert!(needs_ocr(text, 6));
    }

    #[test]
    fn single_page_pdf_never_triggers_ocr() {
        assert!(!needs_ocr("x", 1));
        assert!(!needs_ocr("", 1));
    }

    #[test]
    fn real_text_layer_skips_ocr() {
        let text = "Kunnanhallitus käsitteli kokouksessaan maa-aineslupahakemuksen, \
                    joka koskee 50 000 kuution ottamista Ounasjoen itäpuolelta.";
        assert!(!needs_ocr(text, 6));
    }

    #[test]
    fn whitespace_does_not_count_as_text() {
        let padded = format!("abc{}", " ".repeat(200));
        assert!(needs_ocr(&padded, 3));
    }
}
