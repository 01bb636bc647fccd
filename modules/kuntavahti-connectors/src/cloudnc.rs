//! Connector for the CloudNC meeting-publishing platform.
//!
//! CloudNC municipalities expose a meeting RSS feed (usually `/meetingrss`)
//! whose entries enclose the PDF attachments directly; without a feed, the
//! listing HTML under `/fi-FI/Toimielimet` links meeting pages that carry
//! the attachments. File ids are numeric.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use kuntavahti_common::{DocType, DocumentRef, Platform};

use crate::connector::{Connector, SourceSpec};
use crate::gateway::Gateway;
use crate::parse;

const RSS_PATH: &str = "/meetingrss";
const FALLBACK_LISTINGS: &[(&str, DocType)] = &[
    ("/fi-FI/Toimielimet", DocType::Minutes),
    ("/fi-FI", DocType::Minutes),
];

/// Anchor keywords that mark a meeting or document link in listing HTML.
const LINK_KEYWORDS: &[&str] = &[
    "kokous",
    "download",
    "poytakirja",
    "esityslista",
    "päätös",
    "kuulutus",
    "kaava",
    "asiakirja",
];

pub struct CloudNcConnector {
    spec: SourceSpec,
    gateway: Arc<Gateway>,
}

impl CloudNcConnector {
    pub fn new(spec: SourceSpec, gateway: Arc<Gateway>) -> Self {
        Self { spec, gateway }
    }

    async fn discover_listing(&self, path: &str, doc_type: DocType) -> Result<Vec<DocumentRef>> {
        let base = Url::parse(&self.spec.base_url).context("invalid base URL")?;
        let url = base.join(path).context("invalid listing path")?;
        let body = self
            .gateway
            .fetch_text(url.as_str())
            .await
            .with_context(|| format!("failed to fetch listing {url}"))?;

        // A configured path may point at the meeting RSS instead of HTML.
        if crate::parse::head_of(&body, 500).contains("<rss")
            || crate::parse::head_of(&body, 500).contains("<feed")
        {
            return Ok(parse_cloudnc_rss(&body, &self.spec));
        }

        let mut refs = parse_cloudnc_listing(&body, &url, doc_type, &self.spec);
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
impl Connector for CloudNcConnector {
    fn platform(&self) -> Platform {
        Platform::Cloudnc
    }

    async fn discover(&self) -> Result<Vec<DocumentRef>> {
        let mut documents = Vec::new();

        if let Some(paths) = self.spec.config.paths.clone() {
            for (doc_type, path) in paths.entries() {
                let refs = self.discover_listing(path, doc_type).await?;
                documents.extend(refs);
            }
            return Ok(documents);
        }

        // Meeting RSS first; listing HTML as the fallback.
        let base = Url::parse(&self.spec.base_url).context("invalid base URL")?;
        let rss_url = base.join(RSS_PATH).context("invalid RSS path")?;
        match self.gateway.fetch_text(rss_url.as_str()).await {
            Ok(body) => {
                documents.extend(parse_cloudnc_rss(&body, &self.spec));
            }
            Err(e) => {
                warn!(url = %rss_url, error = %e, "Meeting RSS unavailable");
            }
        }

        if documents.is_empty() {
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

pub fn parse_cloudnc_rss(body: &str, spec: &SourceSpec) -> Vec<DocumentRef> {
    let feed = match feed_rs::parser::parse(body.as_bytes()) {
        Ok(feed) => feed,
        Err(e) => {
            warn!(error = %e, "Unparseable CloudNC meeting RSS");
            return Vec::new();
        }
    };

    let body_overrides = spec.config.body_patterns.as_ref();
    let mut refs = Vec::new();
    for entry in feed.entries {
        let Some(link) = entry
            .links
            .iter()
            .find(|l| l.media_type.as_deref() != Some("application/pdf"))
            .map(|l| l.href.clone())
        else {
            continue;
        };
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }
        let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

        // PDF attachments ride along as enclosures; depending on the feed
        // dialect they surface as links or media objects.
        let mut file_urls: Vec<String> = Vec::new();
        for candidate in entry
            .links
            .iter()
            .filter(|l| {
                l.media_type.as_deref() == Some("application/pdf") || looks_like_file(&l.href)
            })
            .map(|l| l.href.clone())
            .chain(
                entry
                    .media
                    .iter()
                    .flat_map(|m| m.content.iter())
                    .filter_map(|c| c.url.as_ref().map(|u| u.to_string()))
                    .filter(|u| looks_like_file(u)),
            )
        {
            if !file_urls.contains(&candidate) {
                file_urls.push(candidate);
            }
        }
        if file_urls.is_empty() {
            continue;
        }

        let external_id = parse::trailing_numeric_id(&file_urls[0])
            .unwrap_or_else(|| DocumentRef::stable_external_id(&link));
        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::Cloudnc,
            body: parse::extract_body(&title, body_overrides),
            meeting_date: parse::extract_date(&title)
                .or_else(|| published.map(|p| p.date_naive())),
            published_at: published,
            doc_type: parse::infer_doc_type(&title),
            title,
            source_url: link,
            file_urls,
            external_id,
        });
    }
    refs
}

fn looks_like_file(url: &str) -> bool {
    let lowered = url.to_lowercase();
    lowered.contains(".pdf") || lowered.contains("/download/")
}

/// Parse listing HTML for meeting links. Direct PDF links carry their own
/// file; page links come back with empty `file_urls` for the caller.
pub fn parse_cloudnc_listing(
    html: &str,
    base: &Url,
    doc_type: DocType,
    spec: &SourceSpec,
) -> Vec<DocumentRef> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");
    let body_overrides = spec.config.body_patterns.as_ref();

    let mut refs: Vec<DocumentRef> = Vec::new();
    for anchor in document.select(&selector) {
        let href = anchor.value().attr("href").unwrap_or_default();
        if href.starts_with('#') {
            continue;
        }
        let text: String = anchor.text().collect::<Vec<_>>().join(" ");
        let text = text.trim().to_string();

        let haystack = format!("{} {}", href.to_lowercase(), text.to_lowercase());
        if !LINK_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
            continue;
        }

        let Some(full_url) = parse::absolute_url(base, href) else {
            continue;
        };
        if full_url == base.as_str() || refs.iter().any(|d| d.source_url == full_url) {
            continue;
        }
        if text.is_empty() {
            continue;
        }

        let is_file = href.to_lowercase().contains(".pdf");
        let external_id = parse::trailing_numeric_id(&full_url)
            .unwrap_or_else(|| DocumentRef::stable_external_id(&full_url));

        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::Cloudnc,
            body: parse::extract_body(&text, body_overrides),
            meeting_date: parse::extract_date(&text),
            published_at: None,
            doc_type,
            title: text,
            source_url: full_url.clone(),
            file_urls: if is_file { vec![full_url] } else { Vec::new() },
            external_id,
        });
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn spec() -> SourceSpec {
        SourceSpec {
            id: 3,
            municipality: "Rovaniemi".to_string(),
            base_url: "https://rovaniemi.cloudnc.fi".to_string(),
            config: Default::default(),
        }
    }

    #[test]
    fn rss_entries_with_pdf_enclosures_become_refs() {
        let rss = r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0"><channel>
              <title>Kokoukset</title>
              <item>
                <title>Ympäristölautakunta 20.5.2025</title>
                <link>https://rovaniemi.cloudnc.fi/fi-FI/Toimielimet/Ymparistolautakunta/Kokous2052025</link>
                <enclosure url="https://rovaniemi.cloudnc.fi/download/noname/poytakirja/31337" type="application/pdf" length="12345"/>
                <pubDate>Tue, 20 May 2025 12:00:00 GMT</pubDate>
              </item>
            </channel></rss>
        "#;
        let refs = parse_cloudnc_rss(rss, &spec());
        assert_eq!(refs.len(), 1);
        let doc = &refs[0];
        assert_eq!(doc.external_id, "31337");
        assert_eq!(doc.body, "Ympäristölautakunta");
        assert_eq!(doc.meeting_date, NaiveDate::from_ymd_opt(2025, 5, 20));
        assert_eq!(doc.file_urls.len(), 1);
    }

    #[test]
    fn rss_entries_without_files_are_skipped() {
        let rss = r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0"><channel>
              <title>Kokoukset</title>
              <item>
                <title>Kunnanhallitus 1.4.2025</title>
                <link>https://rovaniemi.cloudnc.fi/fi-FI/Toimielimet/Kunnanhallitus</link>
              </item>
            </channel></rss>
        "#;
        assert!(parse_cloudnc_rss(rss, &spec()).is_empty());
    }

    #[test]
    fn listing_html_matches_meeting_links() {
        let base = Url::parse("https://rovaniemi.cloudnc.fi/fi-FI/Toimielimet").unwrap();
        let html = r#"
            <html><body>
              <a href="/fi-FI/Toimielimet/Tekninen/Kokous1232025">Tekninen lautakunta, kokous 12.3.2025</a>
              <a href="/fi-FI/Yhteystiedot">Yhteystiedot</a>
            </body></html>
        "#;
        let refs = parse_cloudnc_listing(html, &base, DocType::Minutes, &spec());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].body, "Tekninen lautakunta");
        assert!(refs[0].file_urls.is_empty());
    }
}
