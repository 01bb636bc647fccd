//! Outbound HTTP with SSRF validation, per-host politeness, and bounded
//! retries. Every request the pipeline makes goes through here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, RETRY_AFTER};
use reqwest::redirect;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use kuntavahti_common::{FetchError, FetchResult};

use crate::security::UrlValidator;

/// Total wall-clock limit per attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Response bodies above this are aborted.
const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
/// Backoff before retry 1, 2, 3.
const RETRY_DELAYS_SECS: [u64; 3] = [1, 4, 16];
const MAX_RETRIES: usize = 3;

/// A completed fetch.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Gateway {
    validator: UrlValidator,
    rate_limiter: RateLimiter,
    user_agent: String,
}

impl Gateway {
    pub fn new(validator: UrlValidator, requests_per_second: f64, user_agent: String) -> Self {
        Self {
            validator,
            rate_limiter: RateLimiter::new(requests_per_second),
            user_agent,
        }
    }

    /// Fetch a URL, returning the (size-capped) body.
    pub async fn fetch(&self, raw_url: &str) -> FetchResult<Response> {
        let url = parse_url(raw_url)?;
        let addrs = self.validator.validate_and_resolve(&url).await?;
        let host = url.host_str().unwrap_or_default().to_string();
        let client = self.build_client(&host, &addrs)?;

        let mut attempt = 0usize;
        loop {
            self.rate_limiter.acquire(&host).await;
            match self.attempt(&client, &url).await {
                Ok(response) => {
                    debug!(url = %url, status = response.status, bytes = response.body.len(), "Fetched");
                    return Ok(response);
                }
                Err((err, retry_after)) => {
                    if err.is_transient() && attempt < MAX_RETRIES {
                        let delay = retry_delay(attempt, retry_after);
                        warn!(url = %url, error = %err, delay_secs = delay.as_secs(), "Retrying fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Fetch a URL and decode the body as text.
    pub async fn fetch_text(&self, raw_url: &str) -> FetchResult<String> {
        Ok(self.fetch(raw_url).await?.text())
    }

    /// Download a URL to `dest_path`, fsyncing before returning. When an
    /// expected mime is given, the response header or the magic bytes must
    /// match. Returns (byte length, detected mime).
    pub async fn download(
        &self,
        raw_url: &str,
        dest_path: &Path,
        expected_mime: Option<&str>,
    ) -> FetchResult<(u64, String)> {
        let response = self.fetch(raw_url).await?;
        let header_mime = response
            .content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
        let detected = detect_mime(header_mime.as_deref(), &response.body);

        if let Some(expected) = expected_mime {
            if !content_matches(expected, header_mime.as_deref(), &response.body) {
                return Err(FetchError::ContentMismatch {
                    url: raw_url.to_string(),
                    expected: expected.to_string(),
                    actual: detected,
                });
            }
        }

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(raw_url, e))?;
        }
        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|e| io_error(raw_url, e))?;
        file.write_all(&response.body)
            .await
            .map_err(|e| io_error(raw_url, e))?;
        // Durable before the DB learns about it.
        file.sync_all().await.map_err(|e| io_error(raw_url, e))?;

        Ok((response.body.len() as u64, detected))
    }

    fn build_client(&self, host: &str, addrs: &[SocketAddr]) -> FetchResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("fi-FI,fi;q=0.9,en;q=0.8"),
        );

        // Redirects are screened with the syntactic checks so a listing
        // can't bounce the crawler onto an internal address.
        let validator = self.validator.clone();
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 5 {
                return attempt.error("too many redirects");
            }
            match validator.validate(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e.to_string()),
            }
        });

        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .timeout(ATTEMPT_TIMEOUT)
            .redirect(policy)
            .resolve_to_addrs(host, addrs)
            .build()
            .map_err(|e| FetchError::TransportError {
                url: host.to_string(),
                detail: e.to_string(),
            })
    }

    /// One attempt. The second tuple element is a parsed Retry-After.
    async fn attempt(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Response, (FetchError, Option<u64>)> {
        let result = client.get(url.clone()).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) => return Err((classify_reqwest_error(url, e), None)),
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err((
                FetchError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
                retry_after,
            ));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_BODY_BYTES {
                return Err((
                    FetchError::Oversize {
                        url: url.to_string(),
                        limit: MAX_BODY_BYTES,
                    },
                    None,
                ));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return Err((classify_reqwest_error(url, e), None)),
            };
            if body.len() as u64 + chunk.len() as u64 > MAX_BODY_BYTES {
                return Err((
                    FetchError::Oversize {
                        url: url.to_string(),
                        limit: MAX_BODY_BYTES,
                    },
                    None,
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(Response {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

fn parse_url(raw: &str) -> FetchResult<Url> {
    Url::parse(raw).map_err(|e| FetchError::BlockedUrl(format!("unparseable URL {raw}: {e}")))
}

fn io_error(url: &str, e: std::io::Error) -> FetchError {
    FetchError::TransportError {
        url: url.to_string(),
        detail: format!("storage write failed: {e}"),
    }
}

fn classify_reqwest_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::TransportError {
            url: url.to_string(),
            detail: e.to_string(),
        }
    }
}

/// Backoff for the given retry, preferring the server's Retry-After.
fn retry_delay(retry: usize, retry_after: Option<u64>) -> Duration {
    match retry_after {
        Some(secs) => Duration::from_secs(secs),
        None => Duration::from_secs(RETRY_DELAYS_SECS[retry.min(RETRY_DELAYS_SECS.len() - 1)]),
    }
}

/// Whether the downloaded content satisfies the expected mime, by header or
/// by magic bytes.
fn content_matches(expected: &str, header_mime: Option<&str>, body: &[u8]) -> bool {
    if header_mime == Some(expected) {
        return true;
    }
    match expected {
        "application/pdf" => body.starts_with(b"%PDF"),
        "text/html" => {
            let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_lowercase();
            head.contains("<html") || head.contains("<!doctype html")
        }
        _ => false,
    }
}

fn detect_mime(header_mime: Option<&str>, body: &[u8]) -> String {
    if body.starts_with(b"%PDF") {
        return "application/pdf".to_string();
    }
    header_mime
        .unwrap_or("application/octet-stream")
        .to_string()
}

// --- Per-host rate limiting ---

/// At most one request per `1/rps` seconds per host. Waiters on the same
/// host queue FIFO on the host's mutex; different hosts don't contend.
struct RateLimiter {
    min_interval: Duration,
    hosts: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>>>,
}

impl RateLimiter {
    fn new(requests_per_second: f64) -> Self {
        let rps = if requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, host: &str) {
        let slot = {
            let mut hosts = self.hosts.lock().expect("rate limiter map poisoned");
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };
        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let next_ok = prev + self.min_interval;
            if next_ok > tokio::time::Instant::now() {
                tokio::time::sleep_until(next_ok).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }
}
