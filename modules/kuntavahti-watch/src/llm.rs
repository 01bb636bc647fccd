//! Language-model client. The pipeline talks to the model through the
//! `LanguageModel` trait so tests can script replies; the production
//! implementation speaks the Anthropic Messages API.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Messages API revision this client speaks.
const API_VERSION: &str = "2023-06-01";
/// Backoff before the first and second retry of an overloaded call.
const RETRY_DELAYS_SECS: [u64; 2] = [1, 4];

/// EUR per million tokens (input, output), matched by model-name prefix.
const MODEL_RATES: &[(&str, f64, f64)] = &[
    ("claude-haiku", 0.92, 4.60),
    ("claude-sonnet", 2.76, 13.80),
    ("claude-opus", 13.80, 69.00),
];
const DEFAULT_RATE: (f64, f64) = (2.76, 13.80);

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// Estimated cost in euros for a finished call.
pub fn estimate_cost_eur(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let (input_rate, output_rate) = MODEL_RATES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_RATE);
    input_tokens as f64 * input_rate / 1_000_000.0 + output_tokens as f64 * output_rate / 1_000_000.0
}

/// Worst-case cost of a call about to be made, for budget enforcement.
pub fn projected_cost_eur(model: &str, max_input_tokens: u32, max_output_tokens: u32) -> f64 {
    estimate_cost_eur(model, i64::from(max_input_tokens), i64::from(max_output_tokens))
}

/// Parse a JSON object out of a model reply, tolerating code fences and
/// prose around the object.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object in model reply"))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| anyhow!("no JSON object in model reply"))?;
    if end < start {
        return Err(anyhow!("malformed JSON object in model reply"));
    }
    serde_json::from_str(&trimmed[start..=end]).context("model reply did not match the schema")
}

// --- Anthropic Messages API client ---

/// Production model client. The endpoint is fixed at construction time
/// (`ANTHROPIC_BASE_URL` overrides the host for proxies and tests), and
/// transient API failures are retried with the same short backoff ladder
/// the HTTP gateway uses, honoring Retry-After.
#[derive(Clone)]
pub struct Claude {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<WireMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

impl Claude {
    pub fn new(api_key: impl Into<String>) -> Self {
        let host = std::env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        Self {
            api_key: api_key.into(),
            endpoint: format!("{}/v1/messages", host.trim_end_matches('/')),
            http: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .expect("failed to build LLM HTTP client"),
        }
    }

    /// Send one wire request, retrying rate limits, server errors, and
    /// connection drops up to twice.
    async fn send(&self, wire: &ChatRequest) -> Result<reqwest::Response> {
        let mut retry = 0usize;
        loop {
            debug!(model = %wire.model, retry, "Model request");
            let sent = self
                .http
                .post(&self.endpoint)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(wire)
                .send()
                .await;

            let can_retry = retry < RETRY_DELAYS_SECS.len();
            match sent {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let overloaded = status.as_u16() == 429 || status.is_server_error();
                    if overloaded && can_retry {
                        let delay = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(RETRY_DELAYS_SECS[retry]);
                        warn!(%status, delay_secs = delay, "Model overloaded, retrying");
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        retry += 1;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(anyhow!("model API error ({status}): {body}"));
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && can_retry => {
                    warn!(error = %e, "Model request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(RETRY_DELAYS_SECS[retry])).await;
                    retry += 1;
                }
                Err(e) => return Err(e).context("model request failed"),
            }
        }
    }
}

#[async_trait]
impl LanguageModel for Claude {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let wire = ChatRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: vec![WireMessage {
                role: "user",
                content: request.user,
            }],
            temperature: 0.0,
        };

        let response = self.send(&wire).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to decode model response")?;
        let text = parsed
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Other => None,
            })
            .ok_or_else(|| anyhow!("no text block in model response"))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }
}

/// Truncate to a character budget, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_chars).collect();
    (format!("{cut}\n\n[...]"), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        value: i32,
    }

    #[test]
    fn parses_bare_json() {
        let probe: Probe = parse_json_reply(r#"{"value": 3}"#).unwrap();
        assert_eq!(probe, Probe { value: 3 });
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let reply = "Here is the result:\n```json\n{\"value\": 7}\n```\nDone.";
        let probe: Probe = parse_json_reply(reply).unwrap();
        assert_eq!(probe, Probe { value: 7 });
    }

    #[test]
    fn rejects_replies_without_json() {
        assert!(parse_json_reply::<Probe>("sorry, I cannot").is_err());
        assert!(parse_json_reply::<Probe>(r#"{"other": 1}"#).is_err());
    }

    #[test]
    fn cost_rates_depend_on_model_family() {
        let haiku = estimate_cost_eur("claude-haiku-4-5-20251001", 1_000_000, 0);
        let sonnet = estimate_cost_eur("claude-sonnet-4-20250514", 1_000_000, 0);
        assert!(haiku < sonnet);
        assert!((haiku - 0.92).abs() < 1e-9);
    }

    #[test]
    fn projected_cost_is_worst_case() {
        let projected = projected_cost_eur("claude-haiku-4-5-20251001", 4000, 500);
        assert!(projected > 0.0);
        assert!(projected < 0.01);
    }

    #[test]
    fn truncation_marks_the_cut() {
        let (text, truncated) = truncate_chars("abcdef", 3);
        assert!(truncated);
        assert!(text.starts_with("abc"));
        assert!(text.ends_with("[...]"));

        let (text, truncated) = truncate_chars("abc", 10);
        assert!(!truncated);
        assert_eq!(text, "abc");
    }
}
