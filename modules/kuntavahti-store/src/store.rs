//! SQLite persistence for the ingestion pipeline.
//!
//! All multi-step writes run inside a transaction so a crashed worker never
//! leaves a document half-updated; stage runners re-claim and redo instead.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use kuntavahti_common::{
    CaseEventType, CaseStatus, Category, Confidence, DocumentRef, DocumentStatus, Stage,
    TextStatus,
};

use crate::records::{
    CaseEventRow, CaseRow, DocumentRow, EvidenceRow, FileRow, NewCase, SourceRow, UpsertOutcome,
};
use crate::{migrate, Result, StoreError};

/// How long a worker claim holds before another worker may steal the row.
const CLAIM_LEASE: StdDuration = StdDuration::from_secs(600);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(StdDuration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        migrate::migrate(&store.pool).await?;
        Ok(store)
    }

    /// In-memory database for tests. Single connection so every query sees
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        migrate::migrate(&store.pool).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- Sources ---

    pub async fn add_source(
        &self,
        municipality: &str,
        platform: &str,
        base_url: &str,
        config_json: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO sources (municipality, platform, base_url, enabled, config_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
            RETURNING id
            "#,
        )
        .bind(municipality)
        .bind(platform)
        .bind(base_url)
        .bind(config_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_source(&self, id: i64) -> Result<Option<SourceRow>> {
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_sources(&self) -> Result<Vec<SourceRow>> {
        let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn enabled_sources(&self) -> Result<Vec<SourceRow>> {
        let rows =
            sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE enabled = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn record_source_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_attempt_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_source_success(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_success_at = ?1, last_error = NULL, consecutive_failures = 0, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_source_failure(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources
            SET last_error = ?1, consecutive_failures = consecutive_failures + 1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Documents ---

    /// Insert a discovered reference, or reconcile it with the existing row
    /// for the same `(source_id, external_id)` pair.
    ///
    /// An unchanged listing leaves the row completely untouched, so
    /// re-running discovery on a quiet upstream is a pure no-op. A changed
    /// listing (title, URL, or attachment list) resets the row to `new`;
    /// the next fetch's hash comparison decides whether anything downstream
    /// actually reruns. Only a changed attachment list replaces the file
    /// rows.
    pub async fn upsert_document(
        &self,
        source_id: i64,
        doc: &DocumentRef,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, DocumentRow>(
            "SELECT * FROM documents WHERE source_id = ?1 AND external_id = ?2",
        )
        .bind(source_id)
        .bind(&doc.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                let document_id = sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO documents
                        (source_id, external_id, doc_type, title, body, meeting_date,
                         published_at, source_url, status, discovered_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'new', ?9, ?9)
                    RETURNING id
                    "#,
                )
                .bind(source_id)
                .bind(&doc.external_id)
                .bind(doc.doc_type.as_str())
                .bind(&doc.title)
                .bind(&doc.body)
                .bind(doc.meeting_date)
                .bind(doc.published_at)
                .bind(&doc.source_url)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;

                for url in &doc.file_urls {
                    sqlx::query(
                        "INSERT INTO files (document_id, url, created_at) VALUES (?1, ?2, ?3)",
                    )
                    .bind(document_id)
                    .bind(url)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }

                UpsertOutcome {
                    document_id,
                    is_new: true,
                    requeued: false,
                }
            }
            Some(row) => {
                let current_urls = sqlx::query_scalar::<_, String>(
                    "SELECT url FROM files WHERE document_id = ?1 AND superseded = 0 ORDER BY id",
                )
                .bind(row.id)
                .fetch_all(&mut *tx)
                .await?;

                let urls_changed = current_urls != doc.file_urls;
                let listing_changed =
                    row.title != doc.title || row.source_url != doc.source_url || urls_changed;

                if listing_changed {
                    sqlx::query(
                        r#"
                        UPDATE documents
                        SET doc_type = ?1, title = ?2, body = ?3, meeting_date = ?4,
                            published_at = ?5, source_url = ?6, status = 'new',
                            fetch_retries = 0, claimed_at = NULL, last_error = NULL,
                            updated_at = ?7
                        WHERE id = ?8
                        "#,
                    )
                    .bind(doc.doc_type.as_str())
                    .bind(&doc.title)
                    .bind(&doc.body)
                    .bind(doc.meeting_date)
                    .bind(doc.published_at)
                    .bind(&doc.source_url)
                    .bind(now)
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;

                    if urls_changed {
                        // Evidence keeps its file rows; everything else from
                        // the old attachment list goes away.
                        sqlx::query(
                            r#"
                            UPDATE files SET superseded = 1
                            WHERE document_id = ?1 AND superseded = 0
                              AND id IN (SELECT file_id FROM evidence WHERE file_id IS NOT NULL)
                            "#,
                        )
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                        sqlx::query(
                            "DELETE FROM files WHERE document_id = ?1 AND superseded = 0",
                        )
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                        for url in &doc.file_urls {
                            sqlx::query(
                                "INSERT INTO files (document_id, url, created_at) VALUES (?1, ?2, ?3)",
                            )
                            .bind(row.id)
                            .bind(url)
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        }
                    }
                }

                UpsertOutcome {
                    document_id: row.id,
                    is_new: false,
                    requeued: listing_changed,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentRow>> {
        let row = sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Compare-and-set status transition. Returns false when another worker
    /// already moved the document.
    pub async fn transition_document(
        &self,
        id: i64,
        from: DocumentStatus,
        to: DocumentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET status = ?1, claimed_at = NULL, updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically claim the next document eligible for `stage`. The claim is
    /// a lease: a worker that dies releases the row after `CLAIM_LEASE`.
    pub async fn claim_next(&self, stage: Stage, now: DateTime<Utc>) -> Result<Option<DocumentRow>> {
        let predicate = match stage {
            Stage::Fetch => "status = 'new'",
            Stage::Extract => "status = 'fetched'",
            // Triage owns every extracted document except candidates that
            // are waiting for case build.
            Stage::Triage => {
                "status = 'extracted' AND NOT (triage_hash IS content_hash \
                 AND triage_score >= 0.5 AND case_built_hash IS NOT content_hash)"
            }
            Stage::CaseBuild => {
                "status = 'extracted' AND triage_hash IS content_hash \
                 AND triage_score >= 0.5 AND case_built_hash IS NOT content_hash"
            }
        };
        let stale_before = now - Duration::from_std(CLAIM_LEASE).expect("lease fits in chrono");
        let sql = format!(
            r#"
            UPDATE documents SET claimed_at = ?1
            WHERE id = (
                SELECT id FROM documents
                WHERE {predicate} AND (claimed_at IS NULL OR claimed_at < ?2)
                ORDER BY id
                LIMIT 1
            )
            RETURNING *
            "#
        );
        let row = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(ref doc) = row {
            debug!(document_id = doc.id, stage = %stage, "Claimed document");
        }
        Ok(row)
    }

    /// Release a claim without changing status, so another stage can pick
    /// the document up immediately.
    pub async fn release_claim(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET claimed_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a document permanently failed with a diagnostic.
    pub async fn mark_document_error(
        &self,
        id: i64,
        diagnostic: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'error', last_error = ?1, claimed_at = NULL, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(diagnostic)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the transient-failure counter, releasing the claim so the next
    /// tick retries. Returns the new count.
    pub async fn increment_fetch_retries(&self, id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE documents SET fetch_retries = fetch_retries + 1, claimed_at = NULL
            WHERE id = ?1
            RETURNING fetch_retries
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn set_content_hash(
        &self,
        id: i64,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET content_hash = ?1, last_fetched_at = ?2, fetch_retries = 0, updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(hash)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_last_fetched(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET last_fetched_at = ?1, fetch_retries = 0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_triage(
        &self,
        id: i64,
        score: f64,
        categories: &[Category],
        reason: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        let categories_json =
            serde_json::to_string(&names).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE documents
            SET triage_score = ?1, triage_categories = ?2, triage_reason = ?3,
                triage_hash = ?4, budget_exhausted = 0, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(score)
        .bind(categories_json)
        .bind(reason)
        .bind(content_hash)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_case_built_hash(&self, id: i64, hash: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET case_built_hash = ?1 WHERE id = ?2")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_budget_exhausted(&self, id: i64, exhausted: bool) -> Result<()> {
        sqlx::query("UPDATE documents SET budget_exhausted = ?1 WHERE id = ?2")
            .bind(exhausted)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_documents_with_status(&self, status: DocumentStatus) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM documents WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count_budget_exhausted(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM documents WHERE budget_exhausted = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete a document, refusing while any evidence row references one of
    /// its files.
    pub async fn delete_document(&self, id: i64) -> Result<bool> {
        let referenced = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM evidence
            WHERE file_id IN (SELECT id FROM files WHERE document_id = ?1)
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if referenced > 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM files WHERE document_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    // --- Files ---

    /// Current (non-superseded) files of a document, in attachment order.
    pub async fn files_for_document(&self, document_id: i64) -> Result<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE document_id = ?1 AND superseded = 0 ORDER BY id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_file_download(
        &self,
        file_id: i64,
        mime: &str,
        byte_len: i64,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files
            SET mime = ?1, byte_len = ?2, storage_path = ?3, fetched_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(mime)
        .bind(byte_len)
        .bind(storage_path)
        .bind(now)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset extraction state after the underlying bytes changed.
    pub async fn reset_files_pending(&self, document_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files SET text_status = 'pending', text_content = NULL
            WHERE document_id = ?1 AND superseded = 0
            "#,
        )
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_file_text(
        &self,
        file_id: i64,
        status: TextStatus,
        text: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET text_status = ?1, text_content = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(text)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Cases, evidence, events ---

    pub async fn create_case(&self, case: &NewCase, now: DateTime<Utc>) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO cases
                (primary_category, headline, summary, status, confidence, confidence_reason,
                 municipalities_json, entities_json, locations_json, first_seen_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            RETURNING id
            "#,
        )
        .bind(case.primary_category.as_str())
        .bind(&case.headline)
        .bind(&case.summary)
        .bind(case.status.as_str())
        .bind(case.confidence.as_str())
        .bind(&case.confidence_reason)
        .bind(to_json(&case.municipalities)?)
        .bind(to_json(&case.entities)?)
        .bind(to_json(&case.locations)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_case(&self, id: i64) -> Result<Option<CaseRow>> {
        let row = sqlx::query_as::<_, CaseRow>("SELECT * FROM cases WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn all_cases(&self) -> Result<Vec<CaseRow>> {
        let rows = sqlx::query_as::<_, CaseRow>("SELECT * FROM cases ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Apply the result of merging a document into an existing case: the
    /// caller passes the already-unioned sets and the (last-writer-wins)
    /// status and confidence.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_case_after_merge(
        &self,
        case_id: i64,
        municipalities: &[String],
        entities: &[String],
        locations: &[String],
        status: CaseStatus,
        confidence: Confidence,
        confidence_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cases
            SET municipalities_json = ?1, entities_json = ?2, locations_json = ?3,
                status = ?4, confidence = ?5, confidence_reason = ?6, updated_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(to_json(municipalities)?)
        .bind(to_json(entities)?)
        .bind(to_json(locations)?)
        .bind(status.as_str())
        .bind(confidence.as_str())
        .bind(confidence_reason)
        .bind(now)
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_evidence(
        &self,
        case_id: i64,
        document_id: i64,
        file_id: Option<i64>,
        page: Option<i64>,
        snippet: &str,
        source_url: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO evidence (case_id, file_id, document_id, page, snippet, source_url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING id
            "#,
        )
        .bind(case_id)
        .bind(file_id)
        .bind(document_id)
        .bind(page)
        .bind(snippet)
        .bind(source_url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn add_case_event(
        &self,
        case_id: i64,
        event_type: CaseEventType,
        event_time: Option<DateTime<Utc>>,
        payload_json: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO case_events (case_id, event_type, event_time, payload_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(case_id)
        .bind(event_type.as_str())
        .bind(event_time)
        .bind(payload_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Events for a case, ordered by event time with insertion order
    /// breaking ties.
    pub async fn events_for_case(&self, case_id: i64) -> Result<Vec<CaseEventRow>> {
        let rows = sqlx::query_as::<_, CaseEventRow>(
            "SELECT * FROM case_events WHERE case_id = ?1 ORDER BY event_time, id",
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn evidence_for_case(&self, case_id: i64) -> Result<Vec<EvidenceRow>> {
        let rows = sqlx::query_as::<_, EvidenceRow>(
            "SELECT * FROM evidence WHERE case_id = ?1 ORDER BY id",
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn evidence_exists_for_document(&self, document_id: i64) -> Result<bool> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM evidence WHERE document_id = ?1")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Distinct cases that cite this document.
    pub async fn case_ids_for_document(&self, document_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT case_id FROM evidence WHERE document_id = ?1 ORDER BY case_id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // --- LLM usage ---

    #[allow(clippy::too_many_arguments)]
    pub async fn record_llm_usage(
        &self,
        document_id: Option<i64>,
        model: &str,
        stage: Stage,
        prompt_tokens: i64,
        completion_tokens: i64,
        estimated_cost_eur: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_usage
                (document_id, model, stage, prompt_tokens, completion_tokens, estimated_cost_eur, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(document_id)
        .bind(model)
        .bind(stage.as_str())
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(estimated_cost_eur)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total estimated LLM spend since the start of the current calendar
    /// month (UTC).
    pub async fn month_to_date_cost(&self, now: DateTime<Utc>) -> Result<f64> {
        let month_start = now
            .date_naive()
            .with_day(1)
            .expect("day 1 always valid")
            .and_hms_opt(0, 0, 0)
            .expect("midnight always valid")
            .and_utc();
        let total = sqlx::query_scalar::<_, Option<f64>>(
            "SELECT SUM(estimated_cost_eur) FROM llm_usage WHERE created_at >= ?1",
        )
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0))
    }
}

fn to_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).map_err(|e| StoreError::Corrupt(e.to_string()))
}
