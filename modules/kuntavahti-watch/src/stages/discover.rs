//! Discover: run every eligible source's connector and reconcile what it
//! found with the documents table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use kuntavahti_common::DocumentRef;
use kuntavahti_connectors::{make_connector, Gateway, SourceSpec};
use kuntavahti_store::{SourceRow, Store};

/// Sources processed concurrently.
const DISCOVER_CONCURRENCY: usize = 8;

#[derive(Debug, Default)]
pub struct DiscoverStats {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub new_documents: usize,
    pub requeued_documents: usize,
}

impl std::fmt::Display for DiscoverStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sources ok, {} failed, {} new documents, {} requeued",
            self.sources_ok, self.sources_failed, self.new_documents, self.requeued_documents
        )
    }
}

/// Discover across the given sources, up to eight at a time. Connector
/// failures are recorded on the source and never abort the run.
pub async fn run_discover(
    store: &Store,
    gateway: Arc<Gateway>,
    sources: Vec<SourceRow>,
    now: DateTime<Utc>,
) -> DiscoverStats {
    let results: Vec<(SourceRow, anyhow::Result<Vec<DocumentRef>>)> = stream::iter(sources)
        .map(|source| {
            let gateway = gateway.clone();
            async move {
                let refs = discover_source(&source, gateway).await;
                (source, refs)
            }
        })
        .buffer_unordered(DISCOVER_CONCURRENCY)
        .collect()
        .await;

    let mut stats = DiscoverStats::default();
    for (source, result) in results {
        if let Err(e) = store.record_source_attempt(source.id, now).await {
            warn!(source_id = source.id, error = %e, "Failed to record attempt");
        }
        match result {
            Ok(refs) => {
                let (new_count, requeued) = save_refs(store, &source, refs, now).await;
                stats.new_documents += new_count;
                stats.requeued_documents += requeued;
                stats.sources_ok += 1;
                if let Err(e) = store.record_source_success(source.id, now).await {
                    warn!(source_id = source.id, error = %e, "Failed to record success");
                }
                info!(
                    municipality = %source.municipality,
                    platform = %source.platform,
                    new = new_count,
                    requeued,
                    "Discovery complete"
                );
            }
            Err(e) => {
                stats.sources_failed += 1;
                warn!(
                    municipality = %source.municipality,
                    platform = %source.platform,
                    error = %e,
                    "Discovery failed"
                );
                if let Err(e) = store.record_source_failure(source.id, &e.to_string(), now).await {
                    warn!(source_id = source.id, error = %e, "Failed to record failure");
                }
            }
        }
    }
    stats
}

async fn discover_source(
    source: &SourceRow,
    gateway: Arc<Gateway>,
) -> anyhow::Result<Vec<DocumentRef>> {
    let platform = source
        .platform()
        .map_err(|e| anyhow::anyhow!("unsupported platform: {e}"))?;
    let spec = SourceSpec {
        id: source.id,
        municipality: source.municipality.clone(),
        base_url: source.base_url.clone(),
        config: source.config(),
    };
    let connector = make_connector(platform, spec, gateway);
    connector.discover().await
}

async fn save_refs(
    store: &Store,
    source: &SourceRow,
    refs: Vec<DocumentRef>,
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut new_count = 0;
    let mut requeued = 0;
    for doc in refs {
        if doc.file_urls.is_empty() {
            warn!(title = %doc.title, "Discovered item without files, skipping");
            continue;
        }
        match store.upsert_document(source.id, &doc, now).await {
            Ok(outcome) => {
                if outcome.is_new {
                    new_count += 1;
                }
                if outcome.requeued {
                    requeued += 1;
                }
            }
            Err(e) => {
                warn!(title = %doc.title, error = %e, "Failed to upsert document");
            }
        }
    }
    (new_count, requeued)
}
