//! Connector for the Dynasty (Innofactor) meeting-document platform.
//!
//! Dynasty serves frame-based listings from `DREQUEST.PHP` endpoints
//! (`meeting_frames`, `official_frames`, announcement searches) and
//! sometimes an RSS feed. Meeting items carry a `docid` query parameter,
//! which is the platform's item id.

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

const FALLBACK_RSS: &[&str] = &["/cgi/DREQUEST.PHP?page=rss/meetingrss", "/rss"];
const FALLBACK_LISTINGS: &[(&str, DocType)] = &[
    ("/cgi/DREQUEST.PHP?page=meeting_frames", DocType::Minutes),
    ("/cgi/DREQUEST.PHP?page=meeting_handlers", DocType::Minutes),
    ("/cgi/DREQUEST.PHP?page=official_frames", DocType::Decision),
];

pub struct DynastyConnector {
    spec: SourceSpec,
    gateway: Arc<Gateway>,
}

impl DynastyConnector {
    pub fn new(spec: SourceSpec, gateway: Arc<Gateway>) -> Self {
        Self { spec, gateway }
    }

    async fn discover_path(&self, path: &str, doc_type: DocType) -> Result<Vec<DocumentRef>> {
        let base = Url::parse(&self.spec.base_url).context("invalid base URL")?;
        let url = base.join(path).context("invalid listing path")?;
        let body = self
            .gateway
            .fetch_text(url.as_str())
            .await
            .with_context(|| format!("failed to fetch listing {url}"))?;

        if looks_like_rss(&body) {
            return Ok(parse_dynasty_rss(&body, doc_type, &self.spec));
        }

        // Frame pages carry the real listing in a content frame.
        let (listing_html, listing_url) = match content_frame_url(&body, &url) {
            Some(frame_url) => match self.gateway.fetch_text(frame_url.as_str()).await {
                Ok(html) => (html, frame_url),
                Err(e) => {
                    warn!(url = %frame_url, error = %e, "Content frame fetch failed");
                    (body, url)
                }
            },
            None => (body, url),
        };

        let mut refs = parse_dynasty_listing(&listing_html, &listing_url, doc_type, &self.spec);
        for doc in &mut refs {
            if doc.file_urls.is_empty() {
                match self.gateway.fetch_text(&doc.source_url).await {
                    Ok(page) => {
                        let page_url = Url::parse(&doc.source_url)?;
                        doc.file_urls = parse::pdf_links(&page, &page_url);
                    }
                    Err(e) => {
                        warn!(url = %doc.source_url, error = %e, "Skipping meeting item");
                    }
                }
            }
        }
        refs.retain(|d| !d.file_urls.is_empty());
        Ok(refs)
    }
}

#[async_trait]
impl Connector for DynastyConnector {
    fn platform(&self) -> Platform {
        Platform::Dynasty
    }

    async fn discover(&self) -> Result<Vec<DocumentRef>> {
        let mut documents = Vec::new();

        if let Some(paths) = self.spec.config.paths.clone() {
            for (doc_type, path) in paths.entries() {
                let refs = self.discover_path(path, doc_type).await?;
                documents.extend(refs);
            }
            return Ok(documents);
        }

        for path in FALLBACK_RSS {
            if let Ok(refs) = self.discover_path(path, DocType::Minutes).await {
                if !refs.is_empty() {
                    return Ok(refs);
                }
            }
        }
        for (path, doc_type) in FALLBACK_LISTINGS {
            if let Ok(refs) = self.discover_path(path, *doc_type).await {
                if !refs.is_empty() {
                    return Ok(refs);
                }
            }
        }
        Ok(documents)
    }
}

fn looks_like_rss(body: &str) -> bool {
    let head = crate::parse::head_of(body, 500);
    head.contains("<rss") || head.contains("<feed")
}

/// The src of the first frame that looks like it holds the listing.
fn content_frame_url(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("frame[src], iframe[src]").expect("valid selector");
    for frame in document.select(&selector) {
        let src = frame.value().attr("src").unwrap_or_default();
        let lowered = src.to_lowercase();
        if ["kokous", "meeting", "official", "announcement"]
            .iter()
            .any(|kw| lowered.contains(kw))
        {
            if let Ok(url) = base.join(src) {
                return Some(url);
            }
        }
    }
    None
}

pub fn parse_dynasty_rss(body: &str, doc_type: DocType, spec: &SourceSpec) -> Vec<DocumentRef> {
    let feed = match feed_rs::parser::parse(body.as_bytes()) {
        Ok(feed) => feed,
        Err(e) => {
            warn!(error = %e, "Unparseable Dynasty RSS feed");
            return Vec::new();
        }
    };

    let body_overrides = spec.config.body_patterns.as_ref();
    let mut refs = Vec::new();
    for entry in feed.entries {
        let Some(link) = entry.links.first().map(|l| l.href.clone()) else {
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

        // Items that are not directly a document need a page visit; those
        // get dropped here rather than guessed at.
        let lowered = link.to_lowercase();
        let is_file = lowered.contains("docid")
            || lowered.contains(".pdf")
            || lowered.contains("download")
            || lowered.contains("htmtxt");
        if !is_file {
            continue;
        }

        let external_id = parse::query_param(&link, "docid")
            .unwrap_or_else(|| DocumentRef::stable_external_id(&link));
        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::Dynasty,
            body: parse::extract_body(&title, body_overrides),
            meeting_date: parse::extract_date(&title)
                .or_else(|| published.map(|p| p.date_naive())),
            published_at: published,
            doc_type,
            title,
            source_url: link.clone(),
            file_urls: vec![link],
            external_id,
        });
    }
    refs
}

/// Parse a Dynasty listing page. Links that are not directly files come
/// back with empty `file_urls` for the caller to resolve.
pub fn parse_dynasty_listing(
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
        let lowered = href.to_lowercase();
        let matches = ["docid=", "kokous", "meeting", "official", "htmtxt", "download"]
            .iter()
            .any(|p| lowered.contains(p));
        if !matches {
            continue;
        }

        let Some(full_url) = parse::absolute_url(base, href) else {
            continue;
        };
        if full_url == base.as_str() || refs.iter().any(|d| d.source_url == full_url) {
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
        let is_file = lowered.contains(".pdf")
            || lowered.contains("download")
            || lowered.contains("htmtxt");

        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::Dynasty,
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn spec() -> SourceSpec {
        SourceSpec {
            id: 2,
            municipality: "Inari".to_string(),
            base_url: "https://inari.oncloudos.com".to_string(),
            config: Default::default(),
        }
    }

    #[test]
    fn finds_content_frame() {
        let base = Url::parse("https://inari.oncloudos.com/cgi/DREQUEST.PHP?page=meeting_frames")
            .unwrap();
        let html = r#"
            <html><frameset>
              <frame src="DREQUEST.PHP?page=header">
              <frame src="DREQUEST.PHP?page=meeting_list&id=5">
            </frameset></html>
        "#;
        let url = content_frame_url(html, &base).unwrap();
        assert!(url.as_str().contains("meeting_list"));
    }

    #[test]
    fn parses_meeting_items_with_docid() {
        let base =
            Url::parse("https://inari.oncloudos.com/cgi/DREQUEST.PHP?page=meeting_list").unwrap();
        let html = r#"
            <html><body><table>
              <tr><td>
                <a href="DREQUEST.PHP?page=meetingitem&docid=1205">
                  Ympäristölautakunta 5.5.2025 § 12 Ympäristölupa
                </a>
              </td></tr>
            </table></body></html>
        "#;
        let refs = parse_dynasty_listing(html, &base, DocType::Minutes, &spec());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].external_id, "1205");
        assert_eq!(refs[0].body, "Ympäristölautakunta");
        assert_eq!(refs[0].meeting_date, NaiveDate::from_ymd_opt(2025, 5, 5));
        assert!(refs[0].file_urls.is_empty());
    }

    #[test]
    fn direct_download_links_carry_their_own_file() {
        let base =
            Url::parse("https://inari.oncloudos.com/cgi/DREQUEST.PHP?page=meeting_list").unwrap();
        let html = r#"
            <html><body>
              <a href="/download/poytakirja.pdf?docid=88">Kunnanhallitus 2.2.2025</a>
            </body></html>
        "#;
        let refs = parse_dynasty_listing(html, &base, DocType::Minutes, &spec());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].external_id, "88");
        assert_eq!(refs[0].file_urls.len(), 1);
    }

    #[test]
    fn rss_entries_become_refs() {
        let rss = r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0"><channel>
              <title>Kokoukset</title>
              <item>
                <title>Tekninen lautakunta 12.3.2025</title>
                <link>https://inari.oncloudos.com/cgi/DREQUEST.PHP?page=meetingitem&amp;docid=77</link>
                <pubDate>Wed, 12 Mar 2025 10:00:00 GMT</pubDate>
              </item>
            </channel></rss>
        "#;
        let refs = parse_dynasty_rss(rss, DocType::Minutes, &spec());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].external_id, "77");
        assert_eq!(refs[0].meeting_date, NaiveDate::from_ymd_opt(2025, 3, 12));
        assert!(refs[0].published_at.is_some());
    }
}
