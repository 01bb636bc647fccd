//! Typed rows for the persistence tables. Enum-valued columns are stored as
//! their snake_case strings and parsed on access.

use chrono::{DateTime, NaiveDate, Utc};
use kuntavahti_common::{
    CaseStatus, Category, Confidence, DocType, DocumentStatus, Platform, SourceConfig, TextStatus,
};

use crate::{Result, StoreError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRow {
    pub id: i64,
    pub municipality: String,
    pub platform: String,
    pub base_url: String,
    pub enabled: bool,
    pub config_json: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn platform(&self) -> Result<Platform> {
        self.platform
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    pub fn config(&self) -> SourceConfig {
        SourceConfig::parse(self.config_json.as_deref())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: i64,
    pub source_id: i64,
    pub external_id: String,
    pub doc_type: String,
    pub title: String,
    pub body: String,
    pub meeting_date: Option<NaiveDate>,
    pub published_at: Option<DateTime<Utc>>,
    pub source_url: String,
    pub status: String,
    pub content_hash: Option<String>,
    pub triage_score: Option<f64>,
    pub triage_categories: Option<String>,
    pub triage_reason: Option<String>,
    pub triage_hash: Option<String>,
    pub case_built_hash: Option<String>,
    pub fetch_retries: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub budget_exhausted: bool,
    pub last_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    pub fn status(&self) -> Result<DocumentStatus> {
        self.status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    pub fn doc_type(&self) -> Result<DocType> {
        self.doc_type
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    /// Triage categories as parsed values; unknown entries are dropped.
    pub fn categories(&self) -> Vec<Category> {
        self.triage_categories
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .map(|names| names.iter().filter_map(|n| n.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Whether the stored triage result still applies to the current content.
    pub fn triage_is_current(&self) -> bool {
        self.triage_hash.is_some() && self.triage_hash == self.content_hash
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub id: i64,
    pub document_id: i64,
    pub url: String,
    pub mime: Option<String>,
    pub byte_len: Option<i64>,
    pub storage_path: Option<String>,
    pub text_status: String,
    pub text_content: Option<String>,
    pub superseded: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FileRow {
    pub fn text_status(&self) -> Result<TextStatus> {
        self.text_status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaseRow {
    pub id: i64,
    pub primary_category: String,
    pub headline: String,
    pub summary: String,
    pub status: String,
    pub confidence: String,
    pub confidence_reason: Option<String>,
    pub municipalities_json: String,
    pub entities_json: String,
    pub locations_json: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRow {
    pub fn primary_category(&self) -> Result<Category> {
        self.primary_category
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    pub fn status(&self) -> Result<CaseStatus> {
        self.status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    pub fn confidence(&self) -> Result<Confidence> {
        self.confidence
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))
    }

    pub fn municipalities(&self) -> Vec<String> {
        parse_string_array(&self.municipalities_json)
    }

    pub fn entities(&self) -> Vec<String> {
        parse_string_array(&self.entities_json)
    }

    pub fn locations(&self) -> Vec<String> {
        parse_string_array(&self.locations_json)
    }
}

fn parse_string_array(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaseEventRow {
    pub id: i64,
    pub case_id: i64,
    pub event_type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub payload_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EvidenceRow {
    pub id: i64,
    pub case_id: i64,
    pub file_id: Option<i64>,
    pub document_id: Option<i64>,
    pub page: Option<i64>,
    pub snippet: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

/// Fields for a freshly built case. Evidence is appended separately but a
/// case is never committed without at least one evidence row.
#[derive(Debug, Clone)]
pub struct NewCase {
    pub primary_category: Category,
    pub headline: String,
    pub summary: String,
    pub status: CaseStatus,
    pub confidence: Confidence,
    pub confidence_reason: Option<String>,
    pub municipalities: Vec<String>,
    pub entities: Vec<String>,
    pub locations: Vec<String>,
}

/// Result of upserting a discovered document reference.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub document_id: i64,
    /// A row was inserted for a previously unseen (source, external id) pair.
    pub is_new: bool,
    /// An existing row was sent back through the fetch stage because the
    /// upstream listing changed.
    pub requeued: bool,
}
