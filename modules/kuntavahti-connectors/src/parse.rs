//! Shared Finnish-listing parsing: committee names, meeting dates, document
//! types, and the small URL helpers every connector needs.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use kuntavahti_common::DocType;

/// Keyword → committee label, checked in order against lowercased text.
const BODY_PATTERNS: &[(&str, &str)] = &[
    ("valtuusto", "Kunnanvaltuusto"),
    ("hallitus", "Kunnanhallitus"),
    ("ympäristö", "Ympäristölautakunta"),
    ("tekninen", "Tekninen lautakunta"),
    ("rakennus", "Rakennuslautakunta"),
    ("hyvinvointi", "Hyvinvointilautakunta"),
    ("sivistys", "Sivistyslautakunta"),
    ("tarkastus", "Tarkastuslautakunta"),
];

const UNKNOWN_BODY: &str = "Tuntematon";

static FINNISH_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{4})").expect("valid regex"));
static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid regex"));
static TRAILING_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\D*$").expect("valid regex"));

/// Committee name from surrounding text, with an optional per-source
/// override table.
pub fn extract_body(text: &str, overrides: Option<&HashMap<String, String>>) -> String {
    let lowered = text.to_lowercase();
    if let Some(table) = overrides {
        let mut keys: Vec<&String> = table.keys().collect();
        keys.sort();
        for key in keys {
            if lowered.contains(&key.to_lowercase()) {
                return table[key].clone();
            }
        }
        return UNKNOWN_BODY.to_string();
    }
    for (keyword, label) in BODY_PATTERNS {
        if lowered.contains(keyword) {
            return (*label).to_string();
        }
    }
    UNKNOWN_BODY.to_string()
}

/// First Finnish (`d.m.yyyy`) or ISO (`yyyy-mm-dd`) date in the text.
pub fn extract_date(text: &str) -> Option<NaiveDate> {
    if let Some(caps) = FINNISH_DATE_RE.captures(text) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    if let Some(caps) = ISO_DATE_RE.captures(text) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}

/// Document type inferred from Finnish keywords; listings that say nothing
/// are treated as minutes.
pub fn infer_doc_type(text: &str) -> DocType {
    let lowered = text.to_lowercase();
    if lowered.contains("esityslista") {
        DocType::Agenda
    } else if lowered.contains("pöytäkirja") || lowered.contains("poytakirja") {
        DocType::Minutes
    } else if lowered.contains("päätös")
        || lowered.contains("paatos")
        || lowered.contains("viranhaltija")
    {
        DocType::Decision
    } else if lowered.contains("kuulutus") {
        DocType::Announcement
    } else {
        DocType::Minutes
    }
}

/// A prefix of `s` at most `max_bytes` long, aligned to a char boundary.
pub fn head_of(s: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A query parameter from an absolute URL.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// The last run of digits in a URL, used by platforms whose ids are numeric
/// path or query suffixes.
pub fn trailing_numeric_id(url: &str) -> Option<String> {
    TRAILING_DIGITS_RE
        .captures(url)
        .map(|caps| caps[1].to_string())
}

/// Resolve `href` against `base`, dropping anchors that don't resolve.
pub fn absolute_url(base: &Url, href: &str) -> Option<String> {
    let resolved = base.join(href).ok()?;
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    Some(resolved.to_string())
}

/// Text of the nearest block-level ancestor, for pulling dates and committee
/// names that sit next to a link rather than inside it.
pub fn parent_block_text(element: &ElementRef) -> String {
    const BLOCKS: &[&str] = &[
        "li", "p", "div", "td", "tr", "article", "section",
    ];
    let mut current = element.parent();
    while let Some(node) = current {
        if let Some(el) = ElementRef::wrap(node) {
            if BLOCKS.contains(&el.value().name()) {
                let text: String = el.text().collect::<Vec<_>>().join(" ");
                return text.split_whitespace().collect::<Vec<_>>().join(" ");
            }
        }
        current = node.parent();
    }
    element.text().collect::<Vec<_>>().join(" ")
}

/// All anchors in the page that look like file links (PDF, fileshow, or
/// download endpoints), resolved against `base`.
pub fn pdf_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");
    let mut out = Vec::new();
    for anchor in document.select(&selector) {
        let href = anchor.value().attr("href").unwrap_or_default();
        let lowered = href.to_lowercase();
        if lowered.contains(".pdf") || lowered.contains("fileshow") || lowered.contains("download")
        {
            if let Some(url) = absolute_url(base, href) {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_committee_from_finnish_text() {
        assert_eq!(
            extract_body("Ympäristölautakunta 13.12.2024", None),
            "Ympäristölautakunta"
        );
        assert_eq!(
            extract_body("Tekninen lautakunta, pöytäkirja 4/2025", None),
            "Tekninen lautakunta"
        );
        assert_eq!(extract_body("Henkilöstöasiat", None), "Tuntematon");
    }

    #[test]
    fn body_overrides_replace_default_table() {
        let mut table = HashMap::new();
        table.insert("elinvoima".to_string(), "Elinvoimalautakunta".to_string());
        assert_eq!(
            extract_body("Elinvoimalautakunnan kokous", Some(&table)),
            "Elinvoimalautakunta"
        );
        // The default table no longer applies.
        assert_eq!(
            extract_body("Ympäristölautakunta", Some(&table)),
            "Tuntematon"
        );
    }

    #[test]
    fn parses_finnish_and_iso_dates() {
        assert_eq!(
            extract_date("Tekninen lautakunta 12.3.2025"),
            NaiveDate::from_ymd_opt(2025, 3, 12)
        );
        assert_eq!(
            extract_date("Julkaistu 2024-12-13"),
            NaiveDate::from_ymd_opt(2024, 12, 13)
        );
        assert_eq!(extract_date("ei päivämäärää"), None);
        // 31.2. is not a date; the ISO fallback still gets a chance.
        assert_eq!(
            extract_date("31.2.2025 tai 2025-02-28"),
            NaiveDate::from_ymd_opt(2025, 2, 28)
        );
    }

    #[test]
    fn infers_doc_type_from_keywords() {
        assert_eq!(infer_doc_type("Esityslista 5/2025"), DocType::Agenda);
        assert_eq!(infer_doc_type("Pöytäkirja 4/2025"), DocType::Minutes);
        assert_eq!(infer_doc_type("Viranhaltijapäätös"), DocType::Decision);
        assert_eq!(infer_doc_type("Kuulutus maa-ainesluvasta"), DocType::Announcement);
        assert_eq!(infer_doc_type("Liite 3"), DocType::Minutes);
    }

    #[test]
    fn pulls_query_params_and_numeric_ids() {
        assert_eq!(
            query_param(
                "http://salla.tweb.fi/ktwebbin/dbisa.dll/ktwebscr/fileshow?doctype=pk&docid=42",
                "docid"
            ),
            Some("42".to_string())
        );
        assert_eq!(
            trailing_numeric_id("https://rovaniemi.cloudnc.fi/download/noname/abc/98765"),
            Some("98765".to_string())
        );
        assert_eq!(trailing_numeric_id("https://example.fi/nodigits"), None);
    }

    #[test]
    fn finds_pdf_like_links() {
        let base = Url::parse("http://salla.tweb.fi/ktwebscr/pk_tek_tweb.htm").unwrap();
        let html = r#"
            <html><body>
              <a href="fileshow?doctype=pk&docid=42">Kokous</a>
              <a href="/liitteet/kartta.PDF">Kartta</a>
              <a href="/muu/sivu.htm">Muu</a>
            </body></html>
        "#;
        let links = pdf_links(html, &base);
        assert_eq!(links.len(), 2);
        assert!(links[0].contains("fileshow"));
        assert!(links[1].ends_with("/liitteet/kartta.PDF"));
    }
}
