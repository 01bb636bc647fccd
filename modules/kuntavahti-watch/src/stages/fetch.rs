//! Fetch: download a document's files, hash them, and detect content
//! changes against the stored hash.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use kuntavahti_common::{CaseEventType, Config, DocumentStatus, FetchError};
use kuntavahti_connectors::Gateway;
use kuntavahti_store::{DocumentRow, Store};

use super::{StageError, StageResult};

/// Transient fetch failures tolerated before the document goes to error.
pub const MAX_FETCH_RETRIES: i64 = 5;

/// Download every file of a claimed `new` document into
/// `{storage}/{source_id}/{file_id}.pdf`, compute the content hash over the
/// bytes in attachment order, and advance to `fetched`. An unchanged hash is
/// a no-op apart from the transition; a changed one replaces the extracted
/// text and notifies any case already citing this document.
pub async fn fetch_document(
    store: &Store,
    gateway: &Gateway,
    config: &Config,
    doc: &DocumentRow,
    now: DateTime<Utc>,
) -> StageResult {
    let files = store.files_for_document(doc.id).await?;
    if files.is_empty() {
        return Err(StageError::Permanent("document has no files".to_string()));
    }

    let mut hasher = Sha256::new();
    for file in &files {
        let relative_path = format!("{}/{}.pdf", doc.source_id, file.id);
        let dest = config.storage_path.join(&relative_path);

        let (byte_len, mime) = gateway
            .download(&file.url, &dest, Some("application/pdf"))
            .await
            .map_err(|e| classify_fetch_error(&file.url, e))?;

        let bytes = tokio::fs::read(&dest)
            .await
            .map_err(|e| StageError::Retryable(format!("read-back of {relative_path} failed: {e}")))?;
        hasher.update(&bytes);

        store
            .record_file_download(file.id, &mime, byte_len as i64, &relative_path, now)
            .await?;
    }
    let content_hash = format!("{:x}", hasher.finalize());

    if doc.content_hash.as_deref() == Some(content_hash.as_str()) {
        // Same bytes as last time; nothing downstream needs to rerun.
        store.mark_last_fetched(doc.id, now).await?;
    } else {
        let content_changed = doc.content_hash.is_some();
        store.set_content_hash(doc.id, &content_hash, now).await?;
        store.reset_files_pending(doc.id).await?;

        if content_changed {
            info!(document_id = doc.id, "Content changed upstream, reprocessing");
            let payload = serde_json::json!({
                "document_id": doc.id,
                "reason": "content_changed",
            })
            .to_string();
            for case_id in store.case_ids_for_document(doc.id).await? {
                store
                    .add_case_event(
                        case_id,
                        CaseEventType::EvidenceAdded,
                        Some(now),
                        Some(&payload),
                        now,
                    )
                    .await?;
            }
        }
    }

    if !store
        .transition_document(doc.id, DocumentStatus::New, DocumentStatus::Fetched, now)
        .await?
    {
        warn!(document_id = doc.id, "Lost fetch transition, discarding work");
    }
    Ok(())
}

fn classify_fetch_error(url: &str, e: FetchError) -> StageError {
    match e {
        FetchError::BlockedUrl(_) | FetchError::ContentMismatch { .. } => {
            StageError::Permanent(format!("{url}: {e}"))
        }
        _ => StageError::Retryable(format!("{url}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_mismatched_content_are_permanent() {
        let e = classify_fetch_error(
            "http://10.0.0.1/doc.pdf",
            FetchError::BlockedUrl("blocked host".to_string()),
        );
        assert!(matches!(e, StageError::Permanent(_)));

        let e = classify_fetch_error(
            "http://salla.tweb.fi/doc.pdf",
            FetchError::ContentMismatch {
                url: "http://salla.tweb.fi/doc.pdf".to_string(),
                expected: "application/pdf".to_string(),
                actual: "text/html".to_string(),
            },
        );
        assert!(matches!(e, StageError::Permanent(_)));
    }

    #[test]
    fn network_failures_are_retryable() {
        let e = classify_fetch_error(
            "http://salla.tweb.fi/doc.pdf",
            FetchError::Timeout("http://salla.tweb.fi/doc.pdf".to_string()),
        );
        assert!(matches!(e, StageError::Retryable(_)));

        let e = classify_fetch_error(
            "http://salla.tweb.fi/doc.pdf",
            FetchError::Status {
                status: 503,
                url: "http://salla.tweb.fi/doc.pdf".to_string(),
            },
        );
        assert!(matches!(e, StageError::Retryable(_)));
    }
}
