//! Gateway behaviour against a local fixture server: retries, Retry-After,
//! content validation, and the SSRF guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use kuntavahti_common::{FetchErrorKind, FetchResult};
use kuntavahti_connectors::{Gateway, UrlValidator};

#[derive(Clone)]
struct Route {
    status: u16,
    content_type: String,
    body: Vec<u8>,
    extra_headers: Vec<(String, String)>,
}

impl Route {
    fn ok(content_type: &str, body: &[u8]) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            body: body.to_vec(),
            extra_headers: Vec::new(),
        }
    }
}

type Routes = Arc<Mutex<HashMap<String, Vec<Route>>>>;

/// Minimal HTTP/1.1 fixture server. Each path holds a queue of responses;
/// the last one repeats.
async fn spawn_server(routes: Routes, hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            let hits = hits.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                hits.fetch_add(1, Ordering::SeqCst);

                let route = {
                    let mut routes = routes.lock().expect("routes lock");
                    match routes.get_mut(&path) {
                        Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                        Some(queue) => queue.first().cloned(),
                        None => None,
                    }
                };
                let route = route.unwrap_or(Route {
                    status: 404,
                    content_type: "text/plain".to_string(),
                    body: b"not found".to_vec(),
                    extra_headers: Vec::new(),
                });

                let reason = match route.status {
                    200 => "OK",
                    404 => "Not Found",
                    429 => "Too Many Requests",
                    _ => "Error",
                };
                let mut header = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                    route.status,
                    reason,
                    route.content_type,
                    route.body.len()
                );
                for (name, value) in &route.extra_headers {
                    header.push_str(&format!("{name}: {value}\r\n"));
                }
                header.push_str("\r\n");

                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&route.body).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn test_gateway() -> Gateway {
    Gateway::new(
        UrlValidator::new().allow_host("127.0.0.1"),
        100.0, // effectively unthrottled for tests
        "Kuntavahti/0.1 (+test@example.fi)".to_string(),
    )
}

#[tokio::test]
async fn retry_after_is_honored_on_429() {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    routes.lock().unwrap().insert(
        "/listing".to_string(),
        vec![
            Route {
                status: 429,
                content_type: "text/plain".to_string(),
                body: b"slow down".to_vec(),
                extra_headers: vec![("Retry-After".to_string(), "1".to_string())],
            },
            Route::ok("text/html", b"<html>kokoukset</html>"),
        ],
    );
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_server(routes, hits.clone()).await;

    let started = std::time::Instant::now();
    let response = test_gateway()
        .fetch(&format!("{base}/listing"))
        .await
        .expect("fetch should succeed on second attempt");

    assert_eq!(response.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
}

#[tokio::test]
async fn plain_4xx_is_not_retried() {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_server(routes, hits.clone()).await;

    let result: FetchResult<_> = test_gateway().fetch(&format!("{base}/missing")).await;
    let err = result.expect_err("404 should fail");
    assert_eq!(err.kind(), FetchErrorKind::Status4xx);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn download_rejects_mismatched_content() {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    routes.lock().unwrap().insert(
        "/doc.pdf".to_string(),
        vec![Route::ok("text/html", b"<html>login page</html>")],
    );
    let base = spawn_server(routes, Arc::new(AtomicUsize::new(0))).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("doc.pdf");
    let err = test_gateway()
        .download(&format!("{base}/doc.pdf"), &dest, Some("application/pdf"))
        .await
        .expect_err("html is not a pdf");
    assert_eq!(err.kind(), FetchErrorKind::ContentMismatch);
}

#[tokio::test]
async fn download_accepts_pdf_magic_bytes() {
    let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
    routes.lock().unwrap().insert(
        "/doc.pdf".to_string(),
        vec![Route::ok("application/octet-stream", b"%PDF-1.4 fake body")],
    );
    let base = spawn_server(routes, Arc::new(AtomicUsize::new(0))).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("42.pdf");
    let (len, mime) = test_gateway()
        .download(&format!("{base}/doc.pdf"), &dest, Some("application/pdf"))
        .await
        .expect("magic bytes should satisfy the check");
    assert_eq!(len, b"%PDF-1.4 fake body".len() as u64);
    assert_eq!(mime, "application/pdf");
    assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.4 fake body");
}

#[tokio::test]
async fn internal_addresses_are_blocked_without_a_request() {
    let gateway = Gateway::new(
        UrlValidator::new(),
        1.0,
        "Kuntavahti/0.1 (+test@example.fi)".to_string(),
    );
    for url in [
        "http://169.254.169.254/latest/meta-data/",
        "http://127.0.0.1/",
        "http://10.0.0.1/",
        "http://[::1]/",
    ] {
        let err = gateway.fetch(url).await.expect_err("must be blocked");
        assert_eq!(err.kind(), FetchErrorKind::BlockedUrl, "{url}");
    }
}
