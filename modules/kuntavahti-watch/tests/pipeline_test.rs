//! End-to-end pipeline scenarios against an in-memory store, a local HTTP
//! fixture server, and a scripted language model. No outside network, no
//! real model.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use kuntavahti_common::{
    Config, DocType, DocumentRef, DocumentStatus, Platform, Stage, TextStatus,
};
use kuntavahti_connectors::{Gateway, UrlValidator};
use kuntavahti_store::Store;
use kuntavahti_watch::budget::LlmBudget;
use kuntavahti_watch::llm::{Completion, CompletionRequest, LanguageModel};
use kuntavahti_watch::stages::{case_build, fetch, triage};

// --- Scripted model ---

struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
        let text = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left"))?;
        Ok(Completion {
            text,
            input_tokens: 1200,
            output_tokens: 200,
        })
    }
}

// --- Fixture HTTP server ---

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

async fn spawn_pdf_server(files: Files) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let files = files.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                let body = files.lock().expect("files lock").get(&path).cloned();
                let (status, body) = match body {
                    Some(body) => ("200 OK", body),
                    None => ("404 Not Found", b"not found".to_vec()),
                };
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/pdf\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

// --- Shared setup ---

fn test_config(storage: &Path) -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        storage_path: storage.to_path_buf(),
        anthropic_api_key: "test-key".to_string(),
        triage_model: "claude-haiku-4-5-20251001".to_string(),
        case_build_model: "claude-sonnet-4-20250514".to_string(),
        llm_monthly_budget_eur: 10.0,
        triage_max_tokens: 4000,
        case_build_max_tokens: 8000,
        tick_interval_secs: 900,
        tick_drain_secs: 600,
        rate_limit_rps: 100.0,
        contact_email: "test@example.fi".to_string(),
    }
}

fn test_gateway() -> Gateway {
    Gateway::new(
        UrlValidator::new().allow_host("127.0.0.1"),
        100.0,
        "Kuntavahti/0.1 (+test@example.fi)".to_string(),
    )
}

fn tweb_ref(base: &str, docid: &str) -> DocumentRef {
    DocumentRef {
        municipality: "Salla".to_string(),
        platform: Platform::Tweb,
        body: "Tekninen lautakunta".to_string(),
        meeting_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 12),
        published_at: None,
        doc_type: DocType::Minutes,
        title: "Tekninen lautakunta 12.3.2025".to_string(),
        source_url: format!("{base}/ktwebscr/pk_tek_tweb.htm?docid={docid}"),
        file_urls: vec![format!("{base}/files/{docid}.pdf")],
        external_id: docid.to_string(),
    }
}

const PERMIT_TEXT: &str = "Tekninen lautakunta käsitteli maa-aineslupahakemuksen. \
    Lapin Sora Oy hakee lupaa 50 000 kuutiometrin ottamiseen Ounasjoen itäpuolelta. \
    Muistutusaika päättyy 15.2.2025. Lupatunnus MAL-2025-42.";

const TRIAGE_HIT: &str = r#"{
    "categories": ["permits_extraction"],
    "relevance_score": 0.9,
    "candidate_reason": "Maa-aineslupa vesistön läheisyydessä"
}"#;

const CASE_REPLY: &str = r#"{
    "headline": "Maa-aineslupa (50 000 m³) vireillä Ounasjoen läheisyydessä",
    "summary": "Muistutusaika päättyy 15.2.2025. Hakija Lapin Sora Oy.",
    "status": "proposed",
    "timeline": [{"event_type": "complaint_window", "event_time": "2025-02-15"}],
    "evidence": [{"page": 3, "snippet": "Lapin Sora Oy hakee lupaa 50 000 kuutiometrin ottamiseen", "source_url": null}],
    "entities": ["Lapin Sora Oy", "MAL-2025-42"],
    "locations": ["Ounasjoen itäpuoli"],
    "confidence": "high",
    "confidence_reason": "Selkeä lupahakemus määräaikoineen"
}"#;

/// Fetch the single claimable document through the fetch stage.
async fn run_fetch_once(store: &Store, gateway: &Gateway, config: &Config) {
    let now = Utc::now();
    let doc = store
        .claim_next(Stage::Fetch, now)
        .await
        .unwrap()
        .expect("a document to fetch");
    fetch::fetch_document(store, gateway, config, &doc, now)
        .await
        .expect("fetch should succeed");
}

/// Mark every file extracted with the given text and move the document to
/// `extracted`, standing in for the PDF/OCR machinery.
async fn inject_extracted_text(store: &Store, doc_id: i64, text: &str) {
    let now = Utc::now();
    for file in store.files_for_document(doc_id).await.unwrap() {
        store
            .set_file_text(file.id, TextStatus::Extracted, Some(text))
            .await
            .unwrap();
    }
    assert!(store
        .transition_document(doc_id, DocumentStatus::Fetched, DocumentStatus::Extracted, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn fetch_is_idempotent_and_discovery_is_quiet_on_rerun() {
    let files: Files = Arc::new(Mutex::new(HashMap::new()));
    files
        .lock()
        .unwrap()
        .insert("/files/42.pdf".to_string(), b"%PDF-1.4 original content".to_vec());
    let base = spawn_pdf_server(files).await;

    let store = Store::in_memory().await.unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = test_config(storage.path());
    let gateway = test_gateway();

    let source_id = store
        .add_source("Salla", "tweb", &base, None)
        .await
        .unwrap();
    let doc_ref = tweb_ref(&base, "42");
    let now = Utc::now();

    let first = store
        .upsert_document(source_id, &doc_ref, now)
        .await
        .unwrap();
    assert!(first.is_new);

    run_fetch_once(&store, &gateway, &config).await;

    let doc = store.get_document(first.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, "fetched");
    let hash_one = doc.content_hash.clone().expect("hash set");
    let stored_files = store.files_for_document(doc.id).await.unwrap();
    assert_eq!(stored_files.len(), 1);
    let on_disk = config
        .storage_path
        .join(stored_files[0].storage_path.as_deref().unwrap());
    assert!(on_disk.exists());

    // Re-running discovery on an unchanged upstream is a no-op.
    let second = store
        .upsert_document(source_id, &doc_ref, now)
        .await
        .unwrap();
    assert!(!second.is_new);
    assert!(!second.requeued);
    assert!(store.claim_next(Stage::Fetch, now).await.unwrap().is_none());

    // Re-fetching unchanged bytes reproduces the hash and adds no files.
    sqlx::query("UPDATE documents SET status = 'new', claimed_at = NULL WHERE id = ?1")
        .bind(doc.id)
        .execute(store.pool())
        .await
        .unwrap();
    run_fetch_once(&store, &gateway, &config).await;
    let doc = store.get_document(doc.id).await.unwrap().unwrap();
    assert_eq!(doc.content_hash.as_deref(), Some(hash_one.as_str()));
    assert_eq!(store.files_for_document(doc.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn changed_content_reprocesses_into_the_same_case() {
    let files: Files = Arc::new(Mutex::new(HashMap::new()));
    files
        .lock()
        .unwrap()
        .insert("/files/42.pdf".to_string(), b"%PDF-1.4 original content".to_vec());
    let base = spawn_pdf_server(files.clone()).await;

    let store = Store::in_memory().await.unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = test_config(storage.path());
    let gateway = test_gateway();
    let budget = LlmBudget::new(config.llm_monthly_budget_eur);

    let source_id = store
        .add_source("Salla", "tweb", &base, None)
        .await
        .unwrap();
    let doc_ref = tweb_ref(&base, "42");
    let now = Utc::now();
    let doc_id = store
        .upsert_document(source_id, &doc_ref, now)
        .await
        .unwrap()
        .document_id;

    // First pass: fetch, extract (injected), triage, case build.
    run_fetch_once(&store, &gateway, &config).await;
    inject_extracted_text(&store, doc_id, PERMIT_TEXT).await;

    let model = ScriptedModel::new(&[TRIAGE_HIT, CASE_REPLY]);
    let claimed = store.claim_next(Stage::Triage, Utc::now()).await.unwrap().unwrap();
    triage::triage_document(&store, &model, &config, &budget, &claimed, Utc::now())
        .await
        .unwrap();

    let claimed = store.claim_next(Stage::CaseBuild, Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, doc_id);
    case_build::build_case(&store, &model, &config, &budget, &claimed, Utc::now())
        .await
        .unwrap();

    let doc = store.get_document(doc_id).await.unwrap().unwrap();
    assert_eq!(doc.status, "processed");
    let cases = store.all_cases().await.unwrap();
    assert_eq!(cases.len(), 1);
    let case = &cases[0];
    assert_eq!(case.primary_category, "permits_extraction");
    assert_eq!(case.municipalities(), vec!["Salla"]);
    let evidence_before = store.evidence_for_case(case.id).await.unwrap().len();
    assert!(evidence_before >= 1);

    // The upstream PDF changes behind the same docid, and the listing shows
    // a corrected title for the meeting.
    files
        .lock()
        .unwrap()
        .insert("/files/42.pdf".to_string(), b"%PDF-1.5 updated decision".to_vec());
    let mut updated_ref = doc_ref.clone();
    updated_ref.title = "Tekninen lautakunta 12.3.2025, korjattu pöytäkirja".to_string();
    let outcome = store
        .upsert_document(source_id, &updated_ref, Utc::now())
        .await
        .unwrap();
    assert!(outcome.requeued);

    run_fetch_once(&store, &gateway, &config).await;
    let doc = store.get_document(doc_id).await.unwrap().unwrap();
    assert_eq!(doc.status, "fetched");
    assert!(doc.content_hash.is_some());

    // The linked case heard about the change before reprocessing finished.
    let events = store.events_for_case(case.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "evidence_added"));

    // Second pass merges instead of duplicating.
    inject_extracted_text(&store, doc_id, PERMIT_TEXT).await;
    let model = ScriptedModel::new(&[TRIAGE_HIT, CASE_REPLY]);
    let claimed = store.claim_next(Stage::Triage, Utc::now()).await.unwrap().unwrap();
    triage::triage_document(&store, &model, &config, &budget, &claimed, Utc::now())
        .await
        .unwrap();
    let claimed = store.claim_next(Stage::CaseBuild, Utc::now()).await.unwrap().unwrap();
    case_build::build_case(&store, &model, &config, &budget, &claimed, Utc::now())
        .await
        .unwrap();

    let cases = store.all_cases().await.unwrap();
    assert_eq!(cases.len(), 1, "reprocessing must not spawn a duplicate case");
    assert_eq!(cases[0].municipalities(), vec!["Salla"]);
    let evidence_after = store.evidence_for_case(case.id).await.unwrap().len();
    assert!(evidence_after > evidence_before);
    let evidence_added = store
        .events_for_case(case.id)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == "evidence_added")
        .count();
    assert!(evidence_added >= 2);
}

#[tokio::test]
async fn relevance_gate_is_exact_at_one_half() {
    let store = Store::in_memory().await.unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = test_config(storage.path());
    let budget = LlmBudget::new(config.llm_monthly_budget_eur);

    let source_id = store
        .add_source("Salla", "tweb", "http://salla.tweb.fi", None)
        .await
        .unwrap();
    let now = Utc::now();

    for (docid, score) in [("100", 0.49), ("101", 0.50)] {
        let mut doc_ref = tweb_ref("http://salla.tweb.fi", docid);
        doc_ref.title = format!("Asemakaavan muutos {docid}");
        let doc_id = store
            .upsert_document(source_id, &doc_ref, now)
            .await
            .unwrap()
            .document_id;
        store.set_content_hash(doc_id, &format!("hash-{docid}"), now).await.unwrap();
        store
            .transition_document(doc_id, DocumentStatus::New, DocumentStatus::Fetched, now)
            .await
            .unwrap();
        inject_extracted_text(&store, doc_id, PERMIT_TEXT).await;

        let reply = format!(
            r#"{{"categories": ["zoning"], "relevance_score": {score}, "candidate_reason": "kaava"}}"#
        );
        let model = ScriptedModel::new(&[&reply]);
        let claimed = store.claim_next(Stage::Triage, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, doc_id);
        triage::triage_document(&store, &model, &config, &budget, &claimed, Utc::now())
            .await
            .unwrap();
    }

    let below = store.get_document(1).await.unwrap().unwrap();
    assert_eq!(below.status, "processed", "0.49 is not a candidate");
    let at_gate = store.get_document(2).await.unwrap().unwrap();
    assert_eq!(at_gate.status, "extracted", "0.50 is a candidate");
    assert!(store.claim_next(Stage::CaseBuild, Utc::now()).await.unwrap().is_some());
}

#[tokio::test]
async fn exhausted_budget_pauses_triage_without_error() {
    let store = Store::in_memory().await.unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = test_config(storage.path());
    let budget = LlmBudget::new(config.llm_monthly_budget_eur);
    let now = Utc::now();

    // Leave less headroom than even the cheapest projected call needs.
    store
        .record_llm_usage(None, "claude-haiku", Stage::Triage, 1_000_000, 50_000, 9.999, now)
        .await
        .unwrap();

    let source_id = store
        .add_source("Salla", "tweb", "http://salla.tweb.fi", None)
        .await
        .unwrap();
    let doc_id = store
        .upsert_document(source_id, &tweb_ref("http://salla.tweb.fi", "7"), now)
        .await
        .unwrap()
        .document_id;
    store.set_content_hash(doc_id, "hash-7", now).await.unwrap();
    store
        .transition_document(doc_id, DocumentStatus::New, DocumentStatus::Fetched, now)
        .await
        .unwrap();
    inject_extracted_text(&store, doc_id, PERMIT_TEXT).await;

    // Any model call would fail loudly; the budget gate must prevent it.
    let model = ScriptedModel::new(&[]);
    let claimed = store.claim_next(Stage::Triage, now).await.unwrap().unwrap();
    triage::triage_document(&store, &model, &config, &budget, &claimed, now)
        .await
        .expect("budget exhaustion is not an error");

    let doc = store.get_document(doc_id).await.unwrap().unwrap();
    assert_eq!(doc.status, "extracted", "document waits for the next budget window");
    assert!(doc.budget_exhausted);
    assert_eq!(store.count_budget_exhausted().await.unwrap(), 1);
}
