//! Generic scraper for municipal websites that publish PDFs straight on
//! their pages (WordPress and friends). Every anchor whose href matches the
//! PDF pattern becomes a document; the committee, date, and type are read
//! from the anchor text and its surrounding block.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;
use url::Url;

use kuntavahti_common::{DocType, DocumentRef, Platform};

use crate::connector::{Connector, SourceSpec};
use crate::gateway::Gateway;
use crate::parse;

const DEFAULT_PDF_PATTERN: &str = r"\.pdf";

pub struct MunicipalWebsiteConnector {
    spec: SourceSpec,
    gateway: Arc<Gateway>,
}

impl MunicipalWebsiteConnector {
    pub fn new(spec: SourceSpec, gateway: Arc<Gateway>) -> Self {
        Self { spec, gateway }
    }

    /// The (path, fixed doc type) pairs to scan: typed paths first, then the
    /// free-form listing paths where the type is inferred from context.
    fn listing_paths(&self) -> Vec<(String, Option<DocType>)> {
        let mut out = Vec::new();
        if let Some(paths) = &self.spec.config.paths {
            for (doc_type, path) in paths.entries() {
                out.push((path.to_string(), Some(doc_type)));
            }
        }
        for path in &self.spec.config.listing_paths {
            out.push((path.clone(), None));
        }
        if out.is_empty() {
            out.push(("/".to_string(), None));
        }
        out
    }
}

#[async_trait]
impl Connector for MunicipalWebsiteConnector {
    fn platform(&self) -> Platform {
        Platform::MunicipalWebsite
    }

    async fn discover(&self) -> Result<Vec<DocumentRef>> {
        let base = Url::parse(&self.spec.base_url).context("invalid base URL")?;
        let mut documents = Vec::new();

        for (path, fixed_type) in self.listing_paths() {
            let listing_url = base.join(&path).context("invalid listing path")?;
            let html = match self.gateway.fetch_text(listing_url.as_str()).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(url = %listing_url, error = %e, "Listing page failed");
                    return Err(e.into());
                }
            };
            documents.extend(parse_pdf_listing(&html, &listing_url, fixed_type, &self.spec));
        }
        Ok(documents)
    }
}

/// Scrape one page for PDF anchors.
pub fn parse_pdf_listing(
    html: &str,
    base: &Url,
    fixed_type: Option<DocType>,
    spec: &SourceSpec,
) -> Vec<DocumentRef> {
    let pattern = spec
        .config
        .pdf_pattern
        .as_deref()
        .unwrap_or(DEFAULT_PDF_PATTERN);
    let pdf_re = match Regex::new(&format!("(?i){pattern}")) {
        Ok(re) => re,
        Err(e) => {
            warn!(pattern, error = %e, "Invalid pdf_pattern, using default");
            Regex::new(&format!("(?i){DEFAULT_PDF_PATTERN}")).expect("valid regex")
        }
    };

    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");
    let body_overrides = spec.config.body_patterns.as_ref();

    let mut refs: Vec<DocumentRef> = Vec::new();
    for anchor in document.select(&selector) {
        let href = anchor.value().attr("href").unwrap_or_default();
        if !pdf_re.is_match(href) {
            continue;
        }
        let Some(full_url) = parse::absolute_url(base, href) else {
            continue;
        };
        if refs.iter().any(|d| d.source_url == full_url) {
            continue;
        }

        let link_text: String = anchor.text().collect::<Vec<_>>().join(" ");
        let link_text = link_text.trim().to_string();
        let context = parse::parent_block_text(&anchor);
        let title = if link_text.is_empty() {
            let mut t = context.clone();
            t.truncate(100);
            t
        } else {
            link_text
        };
        if title.is_empty() {
            continue;
        }

        // The href itself often carries the best type hint
        // (paatos-2024-11.pdf), so include it in the inference text.
        let type_text = format!("{context} {href}");
        let doc_type = fixed_type.unwrap_or_else(|| parse::infer_doc_type(&type_text));

        refs.push(DocumentRef {
            municipality: spec.municipality_label(),
            platform: Platform::MunicipalWebsite,
            body: parse::extract_body(&context, body_overrides),
            meeting_date: parse::extract_date(&context),
            published_at: None,
            doc_type,
            title,
            source_url: full_url.clone(),
            file_urls: vec![full_url.clone()],
            external_id: DocumentRef::stable_external_id(&full_url),
        });
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn spec() -> SourceSpec {
        SourceSpec {
            id: 4,
            municipality: "Utsjoki".to_string(),
            base_url: "https://www.utsjoki.fi".to_string(),
            config: Default::default(),
        }
    }

    #[test]
    fn decision_pdf_in_committee_block() {
        let base = Url::parse("https://www.utsjoki.fi/paatoksenteko/").unwrap();
        let html = r#"
            <html><body>
              <li>
                Ympäristölautakunta 13.12.2024
                <a href="/files/paatos-2024-11-ympäristö.pdf">Lataa päätös</a>
              </li>
            </body></html>
        "#;
        let refs = parse_pdf_listing(html, &base, None, &spec());
        assert_eq!(refs.len(), 1);
        let doc = &refs[0];
        assert_eq!(doc.body, "Ympäristölautakunta");
        assert_eq!(doc.meeting_date, NaiveDate::from_ymd_opt(2024, 12, 13));
        assert_eq!(doc.doc_type, DocType::Decision);
        assert_eq!(doc.file_urls.len(), 1);
        assert_eq!(doc.external_id.len(), 16);
    }

    #[test]
    fn external_id_is_stable_across_runs() {
        let base = Url::parse("https://www.utsjoki.fi/kuulutukset/").unwrap();
        let html = r#"
            <html><body>
              <p><a href="/files/kuulutus.pdf">Kuulutus 1.6.2025</a></p>
            </body></html>
        "#;
        let first = parse_pdf_listing(html, &base, None, &spec());
        let second = parse_pdf_listing(html, &base, None, &spec());
        assert_eq!(first[0].external_id, second[0].external_id);
        assert_eq!(first[0].doc_type, DocType::Announcement);
    }

    #[test]
    fn fixed_doc_type_beats_inference() {
        let base = Url::parse("https://www.utsjoki.fi/esityslistat/").unwrap();
        let html = r#"
            <html><body>
              <p><a href="/files/lista.pdf">Tekninen lautakunta 12.3.2025</a></p>
            </body></html>
        "#;
        let refs = parse_pdf_listing(html, &base, Some(DocType::Agenda), &spec());
        assert_eq!(refs[0].doc_type, DocType::Agenda);
    }

    #[test]
    fn custom_pdf_pattern_and_body_table() {
        let mut config = kuntavahti_common::SourceConfig::default();
        config.pdf_pattern = Some(r"/liite/\d+".to_string());
        let mut table = HashMap::new();
        table.insert("aluehallitus".to_string(), "Aluehallitus".to_string());
        config.body_patterns = Some(table);
        let spec = SourceSpec {
            config,
            ..spec()
        };

        let base = Url::parse("https://www.utsjoki.fi/liitteet/").unwrap();
        let html = r#"
            <html><body>
              <div>Aluehallitus 5.5.2025 <a href="/liite/991">Liite</a></div>
              <div><a href="/files/muu.pdf">Muu tiedosto</a></div>
            </body></html>
        "#;
        let refs = parse_pdf_listing(html, &base, None, &spec);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].body, "Aluehallitus");
        assert!(refs[0].source_url.ends_with("/liite/991"));
    }

    #[test]
    fn non_pdf_anchors_are_ignored() {
        let base = Url::parse("https://www.utsjoki.fi/").unwrap();
        let html = r#"
            <html><body>
              <a href="/ajankohtaista">Ajankohtaista</a>
              <a href="mailto:kirjaamo@utsjoki.fi">Kirjaamo</a>
            </body></html>
        "#;
        assert!(parse_pdf_listing(html, &base, None, &spec()).is_empty());
    }
}
