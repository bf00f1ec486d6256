// Drives PlayerStatsSource against a scripted local HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use ratesync_adapters::{FetchContext, FetchFailure, FetchOutcome, MetricSource, PlayerStatsSource};
use ratesync_core::ModeRating;
use ratesync_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

const RAPID_BODY: &str = r#"{"chess_rapid": {"last": {"rating": 1800, "rd": 5, "date": 1711929600}}}"#;

struct StubServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Answers the n-th request with `script[n]`, repeating the last entry once
/// the script runs out.
async fn serve(script: Vec<(u16, &'static str)>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let paths = Arc::new(Mutex::new(Vec::new()));

    let (task_hits, task_paths) = (hits.clone(), paths.clone());
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = String::from_utf8_lossy(&request);
            if let Some(path) = head.split_whitespace().nth(1) {
                task_paths.lock().unwrap().push(path.to_string());
            }

            let n = task_hits.fetch_add(1, Ordering::SeqCst);
            let (status, body) = script[n.min(script.len() - 1)];
            let response = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                reason(status),
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    StubServer {
        base_url: format!("http://{addr}"),
        hits,
        paths,
    }
}

fn source_for(server: &StubServer, max_retries: usize) -> PlayerStatsSource {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("ratesync-test".to_string()),
        concurrency: 1,
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        },
    })
    .expect("client");
    PlayerStatsSource::new(http, &server.base_url).expect("source")
}

fn ctx() -> FetchContext {
    FetchContext {
        run_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn not_found_is_an_outcome_and_is_not_retried() {
    let server = serve(vec![(404, r#"{"code": 0, "message": "not found"}"#)]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "dave").await;
    assert_eq!(outcome, Ok(FetchOutcome::NotFound));
    assert_eq!(server.hits(), 1);
    assert_eq!(server.paths(), vec!["/pub/player/dave/stats"]);
}

#[tokio::test]
async fn server_error_is_retried_until_success() {
    let server = serve(vec![(503, ""), (200, RAPID_BODY)]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "carol").await.expect("found");
    let FetchOutcome::Found(snapshot) = outcome else {
        panic!("expected Found, got {outcome:?}");
    };
    assert_eq!(
        snapshot.slow,
        ModeRating {
            rating: Some(1800),
            deviation: Some(5),
            last_played: NaiveDate::from_ymd_opt(2024, 4, 1),
        }
    );
    assert!(snapshot.fast.is_empty());
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn throttling_is_retried_like_a_server_error() {
    let server = serve(vec![(429, ""), (429, ""), (200, RAPID_BODY)]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "carol").await;
    assert!(matches!(outcome, Ok(FetchOutcome::Found(_))));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn persistent_server_error_gives_up_after_max_retries() {
    let server = serve(vec![(503, "")]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "bob").await;
    assert_eq!(outcome, Err(FetchFailure::Status(503)));
    assert_eq!(server.hits(), 3);
}

#[tokio::test]
async fn client_error_other_than_not_found_fails_without_retry() {
    let server = serve(vec![(403, "")]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "bob").await;
    assert_eq!(outcome, Err(FetchFailure::Status(403)));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn non_json_success_is_malformed() {
    let server = serve(vec![(200, "<html>maintenance</html>")]).await;
    let source = source_for(&server, 2);

    let outcome = source.fetch(&ctx(), "bob").await;
    assert!(matches!(outcome, Err(FetchFailure::Malformed(_))), "got {outcome:?}");
    assert_eq!(server.hits(), 1);
}
