//! Extract: text-first PDF parsing with OCR fallback for scans.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use kuntavahti_common::{Config, DocumentStatus, TextStatus};
use kuntavahti_store::{DocumentRow, FileRow, Store};

use crate::ocr;
use crate::pdf;

use super::{StageError, StageResult};

/// Extract text from every file of a claimed `fetched` document. A
/// multi-page PDF whose text layer comes up short goes through Tesseract
/// with the Finnish pack; a file that fails outright is marked failed
/// without sinking the document, as long as some file produced text.
pub async fn extract_document(
    store: &Store,
    config: &Config,
    doc: &DocumentRow,
    now: DateTime<Utc>,
) -> StageResult {
    let files = store.files_for_document(doc.id).await?;

    for file in &files {
        let status = file
            .text_status()
            .map_err(|e| StageError::Permanent(e.to_string()))?;
        match status {
            TextStatus::Pending => extract_file(store, config, file).await?,
            // A worker died mid-OCR; pick it back up.
            TextStatus::OcrQueued => run_ocr_for_file(store, config, file).await?,
            _ => {}
        }
    }

    let files = store.files_for_document(doc.id).await?;
    let all_done = files.iter().all(|f| {
        f.text_status()
            .map(|s| s.is_terminal())
            .unwrap_or(false)
    });
    let any_text = files.iter().any(|f| {
        f.text_status().map(|s| s.has_text()).unwrap_or(false)
            && f.text_content.as_deref().is_some_and(|t| !t.trim().is_empty())
    });

    if !all_done {
        return Err(StageError::Retryable(
            "extraction incomplete for some files".to_string(),
        ));
    }
    if !any_text {
        return Err(StageError::Permanent(
            "no text extracted from any file".to_string(),
        ));
    }

    if !store
        .transition_document(doc.id, DocumentStatus::Fetched, DocumentStatus::Extracted, now)
        .await?
    {
        warn!(document_id = doc.id, "Lost extract transition, discarding work");
    }
    Ok(())
}

async fn extract_file(store: &Store, config: &Config, file: &FileRow) -> Result<(), StageError> {
    let Some(relative) = file.storage_path.as_deref() else {
        store.set_file_text(file.id, TextStatus::Failed, None).await?;
        return Ok(());
    };
    let path = config.storage_path.join(relative);

    let extracted = match pdf::extract_pdf_text(&path) {
        Ok(extracted) => extracted,
        Err(e) => {
            warn!(file_id = file.id, error = %e, "PDF extraction failed");
            store.set_file_text(file.id, TextStatus::Failed, None).await?;
            return Ok(());
        }
    };

    if pdf::needs_ocr(&extracted.text, extracted.page_count) {
        info!(
            file_id = file.id,
            pages = extracted.page_count,
            chars = extracted.text.trim().chars().count(),
            "Text layer too thin, queuing OCR"
        );
        store.set_file_text(file.id, TextStatus::OcrQueued, None).await?;
        return run_ocr_for_file(store, config, file).await;
    }

    info!(file_id = file.id, chars = extracted.text.len(), "Text extracted");
    store
        .set_file_text(file.id, TextStatus::Extracted, Some(&extracted.text))
        .await?;
    Ok(())
}

async fn run_ocr_for_file(store: &Store, config: &Config, file: &FileRow) -> Result<(), StageError> {
    let Some(relative) = file.storage_path.as_deref() else {
        store.set_file_text(file.id, TextStatus::Failed, None).await?;
        return Ok(());
    };
    let path = config.storage_path.join(relative);

    match ocr::ocr_pdf(&path).await {
        Ok(text) => {
            // Sidecar keeps the OCR output inspectable next to the PDF.
            let sidecar = path.with_extension("txt");
            if let Err(e) = tokio::fs::write(&sidecar, &text).await {
                warn!(file_id = file.id, error = %e, "Failed to write OCR sidecar");
            }
            store
                .set_file_text(file.id, TextStatus::OcrDone, Some(&text))
                .await?;
        }
        Err(e) => {
            warn!(file_id = file.id, error = %e, "OCR failed");
            store.set_file_text(file.id, TextStatus::Failed, None).await?;
        }
    }
    Ok(())
}

/// Concatenated text of a document's files, in attachment order.
pub fn combined_text(files: &[FileRow]) -> String {
    files
        .iter()
        .filter_map(|f| f.text_content.as_deref())
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
