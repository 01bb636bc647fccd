//! Case build: the strong-model pass that turns a triage candidate into a
//! structured case, then either merges it into a case we already track or
//! creates a new one.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use kuntavahti_common::{
    CaseEventType, CaseStatus, Category, Config, Confidence, DocumentStatus, Stage,
};
use kuntavahti_store::{DocumentRow, FileRow, NewCase, Store, MERGE_THRESHOLD};
use kuntavahti_store::merge::MergeQuery;

use crate::budget::LlmBudget;
use crate::llm::{
    estimate_cost_eur, parse_json_reply, projected_cost_eur, truncate_chars, CompletionRequest,
    LanguageModel,
};
use crate::stages::extract::combined_text;

use super::{StageError, StageResult};

const CASE_BUILD_MAX_OUTPUT_TOKENS: u32 = 1500;
const MAX_PARSE_ATTEMPTS: usize = 2;

const CASE_BUILD_SYSTEM_PROMPT: &str = "\
Olet ympäristöjärjestöjen tiedustelutyökalu. Laadit suomenkielisen raportin \
kunnallisesta ympäristöpäätöksestä. Etsi aina: määräajat (valitusaika, \
muistutusaika, nähtävilläolo), tarkka sijainti ja etäisyys vesistöihin tai \
suojelualueisiin, laajuus (hehtaarit, kuutiot, turbiinit), päätösvaihe ja \
toimijat lupanumeroineen. Todisteiden lainausten on oltava tarkkoja suoria \
lainauksia asiakirjasta, ei parafraaseja.\n\n\
Palauta vain JSON:\n\
{\"headline\": \"...\", \"summary\": \"...\", \
\"status\": \"proposed\"|\"approved\"|\"unknown\", \
\"timeline\": [{\"event_type\": \"approved\"|\"published_notice\"|\"complaint_window\"|\"next_handling\", \"event_time\": \"YYYY-MM-DD\"}], \
\"evidence\": [{\"page\": 1, \"snippet\": \"...\", \"source_url\": \"...\"}], \
\"entities\": [\"...\"], \"locations\": [\"...\"], \
\"confidence\": \"high\"|\"medium\"|\"low\", \"confidence_reason\": \"...\"}";

#[derive(Debug, Deserialize)]
pub struct CaseBuildResponse {
    pub headline: String,
    pub summary: String,
    pub status: String,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    #[serde(default)]
    pub evidence: Vec<EvidenceEntry>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    pub confidence: String,
    #[serde(default)]
    pub confidence_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineEntry {
    pub event_type: String,
    #[serde(default)]
    pub event_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EvidenceEntry {
    #[serde(default)]
    pub page: Option<i64>,
    pub snippet: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Build or extend a case from a claimed candidate document, then move it
/// to `processed`.
pub async fn build_case(
    store: &Store,
    model: &dyn LanguageModel,
    config: &Config,
    budget: &LlmBudget,
    doc: &DocumentRow,
    now: DateTime<Utc>,
) -> StageResult {
    let content_hash = doc
        .content_hash
        .clone()
        .ok_or_else(|| StageError::Permanent("document has no content hash".to_string()))?;
    let primary_category = doc
        .categories()
        .into_iter()
        .next()
        .ok_or_else(|| StageError::Permanent("candidate without triage categories".to_string()))?;

    if config.anthropic_api_key.is_empty() {
        return Err(StageError::Retryable(
            "ANTHROPIC_API_KEY not set, leaving document for later".to_string(),
        ));
    }

    let projected = projected_cost_eur(
        &config.case_build_model,
        config.case_build_max_tokens,
        CASE_BUILD_MAX_OUTPUT_TOKENS,
    );
    if !budget.allows(store, projected, now).await? {
        store.set_budget_exhausted(doc.id, true).await?;
        return Ok(());
    }

    let source = store
        .get_source(doc.source_id)
        .await?
        .ok_or_else(|| StageError::Permanent("source row vanished".to_string()))?;
    let files = store.files_for_document(doc.id).await?;
    let text = combined_text(&files);

    let budget_chars = (config.case_build_max_tokens as usize) * 3;
    let (body_text, truncated) = truncate_chars(&text, budget_chars);
    if truncated {
        info!(document_id = doc.id, budget_chars, "Document truncated for case build");
    }
    let prompt = format!(
        "Municipality: {municipality}\n\
         Body: {body}\n\
         Title: {title}\n\
         Meeting date: {meeting_date}\n\
         Categories: {categories}\n\
         <document>\n{body_text}\n</document>",
        municipality = source.municipality,
        body = doc.body,
        title = doc.title,
        meeting_date = doc
            .meeting_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        categories = doc
            .categories()
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    );

    let response = request_case(store, model, config, doc, &prompt, now).await?;

    let status: CaseStatus = response.status.parse().unwrap_or(CaseStatus::Unknown);
    let confidence: Confidence = response.confidence.parse().unwrap_or(Confidence::Medium);
    let entities = clean_strings(&response.entities);
    let locations = clean_strings(&response.locations);
    let municipality = source.municipality.clone();

    let query = MergeQuery {
        entities: entities.clone(),
        municipalities: vec![municipality.clone()],
        locations: locations.clone(),
        category: primary_category,
        headline: response.headline.clone(),
    };
    let candidates = store.find_merge_candidates(&query).await?;
    let merge_target = candidates
        .into_iter()
        .next()
        .filter(|c| c.score > MERGE_THRESHOLD);

    let primary_file = files
        .iter()
        .find(|f| f.text_content.as_deref().is_some_and(|t| !t.trim().is_empty()))
        .or(files.first());

    let case_id = match merge_target {
        Some(candidate) => {
            let case = candidate.case;
            info!(
                document_id = doc.id,
                case_id = case.id,
                score = candidate.score,
                "Merging into existing case"
            );
            let municipalities = union(case.municipalities(), &[municipality]);
            let entities_merged = union(case.entities(), &entities);
            let locations_merged = union(case.locations(), &locations);
            store
                .update_case_after_merge(
                    case.id,
                    &municipalities,
                    &entities_merged,
                    &locations_merged,
                    status,
                    confidence,
                    response.confidence_reason.as_deref(),
                    now,
                )
                .await?;
            append_evidence(store, case.id, doc, primary_file, &response, now).await?;
            let payload = serde_json::json!({ "document_id": doc.id }).to_string();
            store
                .add_case_event(case.id, CaseEventType::EvidenceAdded, Some(now), Some(&payload), now)
                .await?;
            case.id
        }
        None => {
            let case_id = store
                .create_case(
                    &NewCase {
                        primary_category,
                        headline: response.headline.clone(),
                        summary: response.summary.clone(),
                        status,
                        confidence,
                        confidence_reason: response.confidence_reason.clone(),
                        municipalities: vec![municipality],
                        entities,
                        locations,
                    },
                    now,
                )
                .await?;
            info!(document_id = doc.id, case_id, headline = %response.headline, "New case");
            append_evidence(store, case_id, doc, primary_file, &response, now).await?;
            for entry in &response.timeline {
                let Ok(event_type) = entry.event_type.parse::<CaseEventType>() else {
                    warn!(event_type = %entry.event_type, "Skipping unknown timeline event");
                    continue;
                };
                store
                    .add_case_event(
                        case_id,
                        event_type,
                        entry.event_time.as_deref().and_then(parse_event_time),
                        None,
                        now,
                    )
                    .await?;
            }
            case_id
        }
    };

    store.set_case_built_hash(doc.id, &content_hash).await?;
    if !store
        .transition_document(doc.id, DocumentStatus::Extracted, DocumentStatus::Processed, now)
        .await?
    {
        warn!(document_id = doc.id, case_id, "Lost case-build transition");
    }
    Ok(())
}

async fn request_case(
    store: &Store,
    model: &dyn LanguageModel,
    config: &Config,
    doc: &DocumentRow,
    prompt: &str,
    now: DateTime<Utc>,
) -> Result<CaseBuildResponse, StageError> {
    let mut last_error = String::new();
    for attempt in 1..=MAX_PARSE_ATTEMPTS {
        let completion = model
            .complete(CompletionRequest {
                model: config.case_build_model.clone(),
                system: CASE_BUILD_SYSTEM_PROMPT.to_string(),
                user: prompt.to_string(),
                max_tokens: CASE_BUILD_MAX_OUTPUT_TOKENS,
            })
            .await
            .map_err(|e| StageError::Retryable(format!("case build model call failed: {e}")))?;

        store
            .record_llm_usage(
                Some(doc.id),
                &config.case_build_model,
                Stage::CaseBuild,
                completion.input_tokens,
                completion.output_tokens,
                estimate_cost_eur(
                    &config.case_build_model,
                    completion.input_tokens,
                    completion.output_tokens,
                ),
                now,
            )
            .await?;

        match parse_json_reply::<CaseBuildResponse>(&completion.text) {
            Ok(parsed) if !parsed.headline.trim().is_empty() => return Ok(parsed),
            Ok(_) => {
                warn!(document_id = doc.id, attempt, "Case reply missing headline");
                last_error = "empty headline".to_string();
            }
            Err(e) => {
                warn!(document_id = doc.id, attempt, error = %e, "Unparseable case reply");
                last_error = e.to_string();
            }
        }
    }
    Err(StageError::Permanent(format!(
        "case reply unparseable after {MAX_PARSE_ATTEMPTS} attempts: {last_error}"
    )))
}

/// Append the reply's evidence rows. A case is never left without evidence:
/// if the model cited nothing, the head of the document text stands in.
async fn append_evidence(
    store: &Store,
    case_id: i64,
    doc: &DocumentRow,
    primary_file: Option<&FileRow>,
    response: &CaseBuildResponse,
    now: DateTime<Utc>,
) -> Result<(), StageError> {
    let file_id = primary_file.map(|f| f.id);
    let mut wrote_any = false;
    for entry in &response.evidence {
        if entry.snippet.trim().is_empty() {
            continue;
        }
        store
            .add_evidence(
                case_id,
                doc.id,
                file_id,
                entry.page,
                entry.snippet.trim(),
                entry.source_url.as_deref().unwrap_or(&doc.source_url),
                now,
            )
            .await?;
        wrote_any = true;
    }
    if !wrote_any {
        let fallback: String = primary_file
            .and_then(|f| f.text_content.as_deref())
            .unwrap_or(&doc.title)
            .chars()
            .take(300)
            .collect();
        store
            .add_evidence(case_id, doc.id, file_id, Some(1), fallback.trim(), &doc.source_url, now)
            .await?;
    }
    Ok(())
}

fn clean_strings(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|v| v.eq_ignore_ascii_case(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn union(mut base: Vec<String>, incoming: &[String]) -> Vec<String> {
    for value in incoming {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !base.iter().any(|v| v.trim().eq_ignore_ascii_case(trimmed)) {
            base.push(trimmed.to_string());
        }
    }
    base
}

fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
