//! Triage: decide cheaply whether a document is an environmental matter
//! worth the expensive case-build pass. A deterministic keyword screen runs
//! first; only documents that pass it cost tokens.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use kuntavahti_common::{Category, Config, DocumentStatus, Stage};
use kuntavahti_store::{DocumentRow, Store};

use crate::budget::LlmBudget;
use crate::llm::{
    estimate_cost_eur, parse_json_reply, projected_cost_eur, CompletionRequest, LanguageModel,
};
use crate::stages::extract::combined_text;

use super::{StageError, StageResult};

/// Environmental keywords that keep a document in the running.
pub const TRIAGE_KEYWORDS: &[&str] = &[
    "kaava",
    "yleiskaava",
    "osayleiskaava",
    "asemakaava",
    "poikkeaminen",
    "maa-aines",
    "ympäristölupa",
    "meluilmoitus",
    "vesitalous",
    "ojitus",
    "kuivatus",
    "natura",
    "tuuli",
    "kaivos",
    "turve",
];

/// Committees whose documents always reach the model, keywords or not.
pub const MONITORED_BODIES: &[&str] = &[
    "Ympäristölautakunta",
    "Tekninen lautakunta",
    "Rakennuslautakunta",
    "Kaavoituslautakunta",
    "Lupalautakunta",
];

/// Characters of document text shown to the screen and the model.
const HEAD_CHARS: usize = 2000;
/// Candidate gate on the model's relevance score.
const RELEVANCE_GATE: f64 = 0.5;
/// Model output budget for the structured verdict.
const TRIAGE_MAX_OUTPUT_TOKENS: u32 = 500;
/// Parse attempts before the document errors.
const MAX_PARSE_ATTEMPTS: usize = 2;

const TRIAGE_SYSTEM_PROMPT: &str = "\
You are screening Finnish municipal documents for a nature conservation watchdog. \
Flag only concrete environmental decisions: extraction permits (maa-ainesluvat, \
ympäristöluvat, kaivokset, turvetuotanto), land use and zoning near waterways, \
forests, wetlands or Natura 2000 areas (kaavat, rantakaavat, poikkeamiset), wind \
and other energy or infrastructure projects in natural areas, and forestry, \
ditching or water-system decisions. Ignore committee procedure, HR, schools, \
social services, and budgets without environmental line items. A passing mention \
of ympäristö is not a signal; look for actual permits and land decisions. When in \
doubt, score low.\n\n\
Respond with JSON only:\n\
{\"categories\": [\"zoning\"|\"permits_extraction\"|\"water_wetlands\"|\"industry_infrastructure\"], \
\"relevance_score\": 0.0-1.0, \"candidate_reason\": \"...\"}";

#[derive(Debug, Deserialize)]
pub struct TriageResponse {
    pub categories: Vec<String>,
    pub relevance_score: f64,
    pub candidate_reason: String,
}

/// Deterministic screen: at least one environmental keyword in the title,
/// committee name, or the head of the text, or a monitored committee.
pub fn passes_keyword_screen(title: &str, body: &str, text_head: &str) -> bool {
    let haystack = format!("{title} {body} {text_head}").to_lowercase();
    if TRIAGE_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
        return true;
    }
    MONITORED_BODIES.iter().any(|b| b.eq_ignore_ascii_case(body))
}

/// The candidate gate: score at and above 0.5 with at least one category.
pub fn is_candidate(score: f64, categories: &[Category]) -> bool {
    score >= RELEVANCE_GATE && !categories.is_empty()
}

/// Triage a claimed `extracted` document. Non-candidates move straight to
/// `processed`; candidates keep their status and wait for case build. The
/// triage result is cached against the content hash, so an unchanged
/// document never pays for a second verdict.
pub async fn triage_document(
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

    // Cached verdict for this exact content: close the document out.
    if doc.triage_is_current() {
        if !store
            .transition_document(doc.id, DocumentStatus::Extracted, DocumentStatus::Processed, now)
            .await?
        {
            warn!(document_id = doc.id, "Lost triage transition, discarding work");
        }
        return Ok(());
    }

    let files = store.files_for_document(doc.id).await?;
    let text = combined_text(&files);
    let head: String = text.chars().take(HEAD_CHARS).collect();

    if !passes_keyword_screen(&doc.title, &doc.body, &head) {
        info!(document_id = doc.id, "No environmental signal, skipping model");
        store
            .save_triage(doc.id, 0.0, &[], "no environmental keywords", &content_hash, now)
            .await?;
        if !store
            .transition_document(doc.id, DocumentStatus::Extracted, DocumentStatus::Processed, now)
            .await?
        {
            warn!(document_id = doc.id, "Lost triage transition, discarding work");
        }
        return Ok(());
    }

    if config.anthropic_api_key.is_empty() {
        return Err(StageError::Retryable(
            "ANTHROPIC_API_KEY not set, leaving document for later".to_string(),
        ));
    }

    let projected =
        projected_cost_eur(&config.triage_model, config.triage_max_tokens, TRIAGE_MAX_OUTPUT_TOKENS);
    if !budget.allows(store, projected, now).await? {
        // Not an error: the document resumes when the month rolls over.
        store.set_budget_exhausted(doc.id, true).await?;
        return Ok(());
    }

    let source = store
        .get_source(doc.source_id)
        .await?
        .ok_or_else(|| StageError::Permanent("source row vanished".to_string()))?;
    let prompt = triage_prompt(&source.municipality, doc, &text, config.triage_max_tokens);

    let response = request_verdict(store, model, config, doc, &prompt, now).await?;

    let score = response.relevance_score.clamp(0.0, 1.0);
    let categories: Vec<Category> = response
        .categories
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();
    store
        .save_triage(doc.id, score, &categories, &response.candidate_reason, &content_hash, now)
        .await?;

    if is_candidate(score, &categories) {
        info!(document_id = doc.id, score, "Candidate for case build");
        // Hand the claim over so case build can pick it up this tick.
        store.release_claim(doc.id).await?;
    } else {
        info!(document_id = doc.id, score, "Below relevance gate");
        if !store
            .transition_document(doc.id, DocumentStatus::Extracted, DocumentStatus::Processed, now)
            .await?
        {
            warn!(document_id = doc.id, "Lost triage transition, discarding work");
        }
    }
    Ok(())
}

async fn request_verdict(
    store: &Store,
    model: &dyn LanguageModel,
    config: &Config,
    doc: &DocumentRow,
    prompt: &str,
    now: DateTime<Utc>,
) -> Result<TriageResponse, StageError> {
    let mut last_error = String::new();
    for attempt in 1..=MAX_PARSE_ATTEMPTS {
        let completion = model
            .complete(CompletionRequest {
                model: config.triage_model.clone(),
                system: TRIAGE_SYSTEM_PROMPT.to_string(),
                user: prompt.to_string(),
                max_tokens: TRIAGE_MAX_OUTPUT_TOKENS,
            })
            .await
            .map_err(|e| StageError::Retryable(format!("triage model call failed: {e}")))?;

        store
            .record_llm_usage(
                Some(doc.id),
                &config.triage_model,
                Stage::Triage,
                completion.input_tokens,
                completion.output_tokens,
                estimate_cost_eur(&config.triage_model, completion.input_tokens, completion.output_tokens),
                now,
            )
            .await?;

        match parse_json_reply::<TriageResponse>(&completion.text) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => {
                warn!(document_id = doc.id, attempt, error = %e, "Unparseable triage reply");
                last_error = e.to_string();
            }
        }
    }
    Err(StageError::Permanent(format!(
        "triage reply unparseable after {MAX_PARSE_ATTEMPTS} attempts: {last_error}"
    )))
}

fn triage_prompt(municipality: &str, doc: &DocumentRow, text: &str, max_tokens: u32) -> String {
    // Roughly three characters per token for Finnish text; metadata is small
    // so the head gets nearly the whole budget.
    let budget_chars = (max_tokens as usize) * 3;
    let head: String = text.chars().take(HEAD_CHARS.min(budget_chars)).collect();
    let headings = extract_headings(text).join("; ");
    let meeting_date = doc
        .meeting_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "Municipality: {municipality}\n\
         Body: {body}\n\
         Title: {title}\n\
         Meeting date: {meeting_date}\n\
         Headings: {headings}\n\
         <document>\n{head}\n</document>",
        body = doc.body,
        title = doc.title,
    )
}

/// Section headings: short lines that carry a paragraph sign or are fully
/// upper-case, the way Finnish minutes mark their items.
pub fn extract_headings(text: &str) -> Vec<String> {
    const MAX_HEADINGS: usize = 15;
    text.lines()
        .map(str::trim)
        .filter(|line| {
            let len = line.chars().count();
            if len < 4 || len > 120 {
                return false;
            }
            line.contains('§')
                || (line.chars().filter(|c| c.is_alphabetic()).count() >= 4
                    && line
                        .chars()
                        .filter(|c| c.is_alphabetic())
                        .all(|c| c.is_uppercase()))
        })
        .take(MAX_HEADINGS)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_screen_matches_title_body_or_text() {
        assert!(passes_keyword_screen("Asemakaavan muutos", "Kunnanhallitus", ""));
        assert!(passes_keyword_screen("Kokous 5/2025", "Kunnanhallitus", "haettu maa-aineslupaa"));
        // Monitored committee passes without keywords.
        assert!(passes_keyword_screen("Kokous 5/2025", "Tekninen lautakunta", "ei mitään"));
        assert!(!passes_keyword_screen(
            "Henkilöstökatsaus",
            "Sivistyslautakunta",
            "kouluverkon muutokset"
        ));
    }

    #[test]
    fn relevance_gate_is_inclusive_at_half() {
        let categories = vec![Category::Zoning];
        assert!(!is_candidate(0.49, &categories));
        assert!(is_candidate(0.50, &categories));
        assert!(!is_candidate(0.9, &[]));
    }

    #[test]
    fn triage_response_schema_parses() {
        let reply = r#"{
            "categories": ["permits_extraction", "water_wetlands"],
            "relevance_score": 0.85,
            "candidate_reason": "Maa-aineslupa vesistön läheisyydessä"
        }"#;
        let parsed: TriageResponse = parse_json_reply(reply).unwrap();
        assert_eq!(parsed.categories.len(), 2);
        assert!((parsed.relevance_score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn headings_pick_paragraph_marks_and_upper_case_lines() {
        let text = "KUNNANHALLITUS\n12 § Maa-aineslupa, Lapin Sora Oy\nTavallinen kappale jatkuu tässä pitkään.\nLIITTEET\n";
        let headings = extract_headings(text);
        assert!(headings.iter().any(|h| h.contains('§')));
        assert!(headings.contains(&"KUNNANHALLITUS".to_string()));
        assert_eq!(headings.len(), 3);
    }
}
