//! Embedded schema, applied idempotently on startup.

use sqlx::SqlitePool;

use crate::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    municipality         TEXT NOT NULL,
    platform             TEXT NOT NULL,
    base_url             TEXT NOT NULL,
    enabled              INTEGER NOT NULL DEFAULT 1,
    config_json          TEXT,
    last_success_at      TEXT,
    last_error           TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_attempt_at      TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_enabled ON sources(enabled);

CREATE TABLE IF NOT EXISTS documents (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id         INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    external_id       TEXT NOT NULL,
    doc_type          TEXT NOT NULL,
    title             TEXT NOT NULL,
    body              TEXT NOT NULL,
    meeting_date      TEXT,
    published_at      TEXT,
    source_url        TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'new',
    content_hash      TEXT,
    triage_score      REAL,
    triage_categories TEXT,
    triage_reason     TEXT,
    triage_hash       TEXT,
    case_built_hash   TEXT,
    fetch_retries     INTEGER NOT NULL DEFAULT 0,
    claimed_at        TEXT,
    budget_exhausted  INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    last_fetched_at   TEXT,
    discovered_at     TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE(source_id, external_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
CREATE INDEX IF NOT EXISTS idx_documents_status_score ON documents(status, triage_score);

CREATE TABLE IF NOT EXISTS files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id   INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    mime          TEXT,
    byte_len      INTEGER,
    storage_path  TEXT,
    text_status   TEXT NOT NULL DEFAULT 'pending',
    text_content  TEXT,
    superseded    INTEGER NOT NULL DEFAULT 0,
    fetched_at    TEXT,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_document ON files(document_id, superseded);

CREATE TABLE IF NOT EXISTS cases (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    primary_category    TEXT NOT NULL,
    headline            TEXT NOT NULL,
    summary             TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'unknown',
    confidence          TEXT NOT NULL DEFAULT 'medium',
    confidence_reason   TEXT,
    municipalities_json TEXT NOT NULL DEFAULT '[]',
    entities_json       TEXT NOT NULL DEFAULT '[]',
    locations_json      TEXT NOT NULL DEFAULT '[]',
    first_seen_at       TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cases_category ON cases(primary_category);
CREATE INDEX IF NOT EXISTS idx_cases_updated ON cases(updated_at);

CREATE TABLE IF NOT EXISTS case_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id      INTEGER NOT NULL REFERENCES cases(id) ON DELETE CASCADE,
    event_type   TEXT NOT NULL,
    event_time   TEXT,
    payload_json TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_case_events_case ON case_events(case_id, event_time);

CREATE TABLE IF NOT EXISTS evidence (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id     INTEGER NOT NULL REFERENCES cases(id) ON DELETE CASCADE,
    file_id     INTEGER REFERENCES files(id),
    document_id INTEGER REFERENCES documents(id),
    page        INTEGER,
    snippet     TEXT NOT NULL,
    source_url  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evidence_case ON evidence(case_id);
CREATE INDEX IF NOT EXISTS idx_evidence_document ON evidence(document_id);

CREATE TABLE IF NOT EXISTS llm_usage (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id        INTEGER REFERENCES documents(id),
    model              TEXT NOT NULL,
    stage              TEXT NOT NULL,
    prompt_tokens      INTEGER NOT NULL DEFAULT 0,
    completion_tokens  INTEGER NOT NULL DEFAULT 0,
    estimated_cost_eur REAL NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_llm_usage_created ON llm_usage(created_at);
"#;

/// Create all tables and indexes if they don't exist yet.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
