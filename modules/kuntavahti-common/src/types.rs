use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// --- Platform & document enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Cloudnc,
    Dynasty,
    Tweb,
    MunicipalWebsite,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Cloudnc => "cloudnc",
            Platform::Dynasty => "dynasty",
            Platform::Tweb => "tweb",
            Platform::MunicipalWebsite => "municipal_website",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloudnc" => Ok(Platform::Cloudnc),
            "dynasty" => Ok(Platform::Dynasty),
            "tweb" => Ok(Platform::Tweb),
            "municipal_website" => Ok(Platform::MunicipalWebsite),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Agenda,
    Minutes,
    Decision,
    Announcement,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Agenda => "agenda",
            DocType::Minutes => "minutes",
            DocType::Decision => "decision",
            DocType::Announcement => "announcement",
        }
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agenda" => Ok(DocType::Agenda),
            "minutes" => Ok(DocType::Minutes),
            "decision" => Ok(DocType::Decision),
            "announcement" => Ok(DocType::Announcement),
            other => Err(format!("unknown doc type: {other}")),
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a document. Transitions run
/// new → fetched → extracted → processed, with error reachable from any of
/// them and a changed upstream resetting back to fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    New,
    Fetched,
    Extracted,
    Processed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::New => "new",
            DocumentStatus::Fetched => "fetched",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Error => "error",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DocumentStatus::New),
            "fetched" => Ok(DocumentStatus::Fetched),
            "extracted" => Ok(DocumentStatus::Extracted),
            "processed" => Ok(DocumentStatus::Processed),
            "error" => Ok(DocumentStatus::Error),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextStatus {
    Pending,
    Extracted,
    OcrQueued,
    OcrDone,
    Failed,
}

impl TextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextStatus::Pending => "pending",
            TextStatus::Extracted => "extracted",
            TextStatus::OcrQueued => "ocr_queued",
            TextStatus::OcrDone => "ocr_done",
            TextStatus::Failed => "failed",
        }
    }

    /// Extraction has run to completion for this file, one way or the other.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TextStatus::Extracted | TextStatus::OcrDone | TextStatus::Failed
        )
    }

    pub fn has_text(&self) -> bool {
        matches!(self, TextStatus::Extracted | TextStatus::OcrDone)
    }
}

impl FromStr for TextStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TextStatus::Pending),
            "extracted" => Ok(TextStatus::Extracted),
            "ocr_queued" => Ok(TextStatus::OcrQueued),
            "ocr_done" => Ok(TextStatus::OcrDone),
            "failed" => Ok(TextStatus::Failed),
            other => Err(format!("unknown text status: {other}")),
        }
    }
}

// --- Case enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Zoning,
    PermitsExtraction,
    WaterWetlands,
    IndustryInfrastructure,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Zoning => "zoning",
            Category::PermitsExtraction => "permits_extraction",
            Category::WaterWetlands => "water_wetlands",
            Category::IndustryInfrastructure => "industry_infrastructure",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zoning" => Ok(Category::Zoning),
            "permits_extraction" => Ok(Category::PermitsExtraction),
            "water_wetlands" => Ok(Category::WaterWetlands),
            "industry_infrastructure" => Ok(Category::IndustryInfrastructure),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Proposed,
    Approved,
    Unknown,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Proposed => "proposed",
            CaseStatus::Approved => "approved",
            CaseStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(CaseStatus::Proposed),
            "approved" => Ok(CaseStatus::Approved),
            "unknown" => Ok(CaseStatus::Unknown),
            other => Err(format!("unknown case status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            other => Err(format!("unknown confidence: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseEventType {
    Approved,
    PublishedNotice,
    ComplaintWindow,
    NextHandling,
    EvidenceAdded,
}

impl CaseEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseEventType::Approved => "approved",
            CaseEventType::PublishedNotice => "published_notice",
            CaseEventType::ComplaintWindow => "complaint_window",
            CaseEventType::NextHandling => "next_handling",
            CaseEventType::EvidenceAdded => "evidence_added",
        }
    }
}

impl FromStr for CaseEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(CaseEventType::Approved),
            "published_notice" => Ok(CaseEventType::PublishedNotice),
            "complaint_window" => Ok(CaseEventType::ComplaintWindow),
            "next_handling" => Ok(CaseEventType::NextHandling),
            "evidence_added" => Ok(CaseEventType::EvidenceAdded),
            other => Err(format!("unknown case event type: {other}")),
        }
    }
}

// --- Pipeline stages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Triage,
    CaseBuild,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Triage => "triage",
            Stage::CaseBuild => "case_build",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- DocumentRef ---

/// One discovered upstream item, in the shape every connector emits.
/// Strict on unknown keys so a connector can't smuggle platform noise past
/// the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentRef {
    pub municipality: String,
    pub platform: Platform,
    /// Committee or organ that owns the meeting (e.g. Ympäristölautakunta).
    pub body: String,
    pub meeting_date: Option<NaiveDate>,
    pub published_at: Option<DateTime<Utc>>,
    pub doc_type: DocType,
    pub title: String,
    pub source_url: String,
    pub file_urls: Vec<String>,
    pub external_id: String,
}

impl DocumentRef {
    /// Stable fallback external id derived from the source URL, for
    /// platforms that don't expose their own identifier.
    pub fn stable_external_id(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let hex = format!("{digest:x}");
        hex[..16].to_string()
    }
}

// --- Source configuration ---

/// Per-source configuration blob stored as JSON on the sources row.
/// Unknown keys are ignored; each connector validates the keys it needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub listing_paths: Vec<String>,
    #[serde(default)]
    pub paths: Option<DocTypePaths>,
    #[serde(default)]
    pub municipality: Option<String>,
    /// Overrides the built-in committee keyword table.
    #[serde(default)]
    pub body_patterns: Option<HashMap<String, String>>,
    /// Overrides the default `.pdf` anchor pattern for the generic scraper.
    #[serde(default)]
    pub pdf_pattern: Option<String>,
}

/// Listing path per upstream document type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocTypePaths {
    #[serde(default)]
    pub meetings: Option<String>,
    #[serde(default)]
    pub agendas: Option<String>,
    #[serde(default)]
    pub officer_decisions: Option<String>,
    #[serde(default)]
    pub announcements: Option<String>,
}

impl DocTypePaths {
    /// Iterate configured (doc_type, path) pairs in a fixed order.
    pub fn entries(&self) -> Vec<(DocType, &str)> {
        let mut out = Vec::new();
        if let Some(p) = self.meetings.as_deref() {
            out.push((DocType::Minutes, p));
        }
        if let Some(p) = self.agendas.as_deref() {
            out.push((DocType::Agenda, p));
        }
        if let Some(p) = self.officer_decisions.as_deref() {
            out.push((DocType::Decision, p));
        }
        if let Some(p) = self.announcements.as_deref() {
            out.push((DocType::Announcement, p));
        }
        out
    }
}

impl SourceConfig {
    pub fn parse(json: Option<&str>) -> Self {
        json.and_then(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| {
                    tracing::warn!(error = %e, "Invalid source config JSON, using defaults");
                })
                .ok()
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips() {
        for p in [
            Platform::Cloudnc,
            Platform::Dynasty,
            Platform::Tweb,
            Platform::MunicipalWebsite,
        ] {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
    }

    #[test]
    fn status_round_trips() {
        for s in ["new", "fetched", "extracted", "processed", "error"] {
            assert_eq!(s.parse::<DocumentStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn stable_external_id_is_deterministic() {
        let a = DocumentRef::stable_external_id("https://example.fi/doc.pdf");
        let b = DocumentRef::stable_external_id("https://example.fi/doc.pdf");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(
            a,
            DocumentRef::stable_external_id("https://example.fi/other.pdf")
        );
    }

    #[test]
    fn document_ref_rejects_unknown_keys() {
        let json = r#"{
            "municipality": "Salla",
            "platform": "tweb",
            "body": "Tekninen lautakunta",
            "meeting_date": null,
            "published_at": null,
            "doc_type": "minutes",
            "title": "Kokous",
            "source_url": "https://salla.tweb.fi/x",
            "file_urls": ["https://salla.tweb.fi/x.pdf"],
            "external_id": "42",
            "extra_field": true
        }"#;
        assert!(serde_json::from_str::<DocumentRef>(json).is_err());
    }

    #[test]
    fn source_config_ignores_unknown_keys() {
        let cfg = SourceConfig::parse(Some(
            r#"{"listing_paths": ["/poytakirjat"], "surprise": 1}"#,
        ));
        assert_eq!(cfg.listing_paths, vec!["/poytakirjat"]);
    }

    #[test]
    fn doc_type_paths_iterate_in_order() {
        let paths = DocTypePaths {
            meetings: Some("/pk".into()),
            agendas: None,
            officer_decisions: Some("/vp".into()),
            announcements: None,
        };
        let entries = paths.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, DocType::Minutes);
        assert_eq!(entries[1].0, DocType::Decision);
    }
}
