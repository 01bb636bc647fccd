//! Connector for the TWeb/KTweb meeting-document platform.
//!
//! Listings are `*_tweb.htm` pages (pöytäkirjat, esityslistat,
//! viranhaltijapäätökset, kuulutukset) whose rows link either straight to
//! `fileshow?doctype=...&docid=...` documents or to meeting pages that in
//! turn carry the file links. `docid` is the platform's own identifier.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use kuntavahti_common::{DocType, DocumentRef, Platform};

use crate::connector::{Connector, SourceSpec};
use crate::gateway::Gateway;
use crate::parse;

/// Generic listing paths tried when the source has no configured paths.
const FALLBACK_LISTINGS: &[(&str, DocType)] = &[
    ("/ktwebscr/pk_tek_tweb.htm", DocType::Minutes),
    ("/ktwebbin/dbisa.dll/ktwebscr/pk_tek_tweb.htm", DocType::Minutes),
    ("/ktwebscr/epj_tek_tweb.htm", DocType::Agenda),
    ("/ktwebbin/dbisa.dll/ktwebscr/epj_tek_tweb.htm", DocType::Agenda),
    ("/ktwebscr/vparhaku_tweb.htm", DocType::Decision),
    ("/ktwebscr/kuullist_tweb.htm", DocType::Announcement),
];

pub struct TwebConnector {
    spec: SourceSpec,
    gateway: Arc<Gateway>,
}

impl TwebConnector {
    pub fn new(spec: SourceSpec, gateway: Arc<Gateway>) -> Self {
        Self { spec, gateway }
    }

    async fn discover_listing(&self, path: &str, doc_type: DocType) -> Result<Vec<DocumentRef>> {
        let base = Url::parse(&self.spec.base_url).context("invalid base URL")?;
        let listing_url = base.join(path).context("invalid listing path")?;
        let html = self
            .gateway
            .fetch_text(listing_url.as_str())
            .await
            .with_context(|| format!("failed to fetch listing {listing_url}"))?;

        let mut refs = parse_tweb_listing(&html, &listing_url, doc_type, &self.spec);

        // Rows linking to a meeting page rather than a file: pull the file
        // links off the page, skipping rows that fail.
        for doc in &mut refs {
            if doc.file_urls.is_empty() {
                match self.gateway.fetch_text(&doc.source_url).await {
                    Ok(page) => {
                        let page_url = Url::parse(&doc.source_url)?;
                        doc.file_urls = parse::pdf_links(&page, &page_url);
                    }
                    Err(e) => {
                        warn!(url = %doc.source_url, error = %e, "Skipping meeting page");
                    }
                }
            }
        }
        refs.retain(|d| !d.file_urls.is_empty());
        Ok(refs)
    }
}

#[async_trait]
impl Connector for TwebConnector {
    fn platform(&self) -> Platform {
        Platform::Tweb
    }

    async fn discover(&self) -> Result<Vec<DocumentRef>> {
        let mut documents = Vec::new();

        if let Some(paths) = self.spec.config.paths.clone() {
            for (doc_type, path) in paths.entries() {
                match self.discover_listing(path, doc_type).await {
                    Ok(refs) => documents.extend(refs),
                    Err(e) => {
                        warn!(path, error = %e, "TWeb listing failed");
                        return Err(e);
                    }
                }
            }
        } else {
            for (path, doc_type) in FALLBACK_LISTINGS {
                match self.discover_listing(path, *doc_type).await {
                    Ok(refs) if !refs.is_empty() => {
                        documents.extend(refs);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => continue,
                }
            }
        }

        Ok(documents)
    }
}

/// Parse one TWeb listing page. Rows whose link is itself a file get their
/// `file_urls` filled in; page links come back with an empty list for the
/// caller to resolve.
pub fn parse_tweb_listing(
    html: &str,
    base: &Url,
    doc_type: DocType,
    spec: &SourceSpec,
) -> Vec<DocumentRef> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a[href]").expect("valid selector");
    let body_overrides = spec.config.body_patterns.as_ref();

    let mut refs: Vec<DocumentRef> = Vec::new();
    for anchor in document.select(&anchor_selector) {
        let href = anchor.value().attr("href").unwrap_or_default();
        let lowered = href.to_lowercase();
        let is_document_link = ["fileshow", "docid", "kokous", "htmtxt"]
            .iter()
            .any(|p| lowered.contains(p));
        if !is_document_link {
            continue;
        }

        let Some(full_url) = parse::absolute_url(base, href) else {
            continue;
        };
        if refs.iter().any(|d| d.source_url == full_url) {
            continue;
        }

        let text: String = anchor.text().collect::<Vec<_>>().join(" ");
        let text = text.trim().to_string();
        let context = parse::parent_block_text(&anchor);
        let title = if text.is_empty() { context.clone() } else { text };
        if title.is_empty() {
            continue;
        }

        let external_id = parse::query_param(&full_url, "docid")
            .unwrap_or_else(|| DocumentRef::stable_external_id(&full_url));
        let is_file = lowered.contains("fileshow") || lowered.contains(".pdf");

        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::Tweb,
            body: parse::extract_body(&context, body_overrides),
            meeting_date: parse::extract_date(&context),
            published_at: None,
            doc_type,
            title,
            source_url: full_url.clone(),
            file_urls: if is_file { vec![full_url] } else { Vec::new() },
            external_id,
        });
    }
    refs
}
