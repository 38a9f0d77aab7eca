//! End-to-end tests driving the accept loop over real TCP connections.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use doubt_gate::server::{ServerState, serve, spawn_ledger_pruner};
use doubt_gate::{
    AppState, ChatCompletionRequest, CompletionGateway, CompletionService, Config, ManualClock,
    QuotaLedger, Tier, UpstreamConfig,
};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use common::*;

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Starts the gateway on an ephemeral port; dropping the sender stops it.
async fn start_gateway(app: AppState) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(serve(listener, ServerState::new(app), async {
        let _ = rx.await;
    }));

    (addr, tx)
}

fn post_to(addr: SocketAddr, body: &serde_json::Value) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("http://{addr}{ENDPOINT}"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[tokio::test]
async fn serves_answers_over_tcp() {
    init_tracing();
    let backend = start_completion_backend(ANSWER_JSON).await;
    let (addr, _shutdown) = start_gateway(test_state(test_config(&backend))).await;

    let resp = client().request(post_to(addr, &valid_body())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["remaining"], 9);
}

#[tokio::test]
async fn rejects_when_concurrency_limit_reached() {
    init_tracing();
    let backend = start_completion_backend_with_delay(
        StatusCode::OK,
        completion_envelope(ANSWER_JSON),
        Duration::from_millis(800),
    )
    .await;
    let state = test_state(test_config_with(&backend, |config| {
        config.max_concurrent_requests = Some(1);
    }));
    let (addr, _shutdown) = start_gateway(state).await;

    let slow = tokio::spawn(client().request(post_to(addr, &valid_body())));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let busy = client().request(post_to(addr, &valid_body())).await.unwrap();
    assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(busy.headers()["access-control-allow-origin"], "*");
    let bytes = busy.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "Server busy");

    let first = slow.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
}

#[tokio::test]
async fn stops_accepting_after_shutdown() {
    init_tracing();
    let backend = start_completion_backend(ANSWER_JSON).await;
    let (addr, shutdown) = start_gateway(test_state(test_config(&backend))).await;

    shutdown.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = client().request(post_to(addr, &valid_body())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn pruner_sweeps_expired_records() {
    init_tracing();
    let backend = start_completion_backend(ANSWER_JSON).await;
    let clock = ManualClock::default();
    let state = test_state_with_clock(test_config(&backend), clock.clone());

    state.ledger.check_and_consume("203.0.113.7", Tier::Anonymous);
    assert_eq!(state.ledger.tracked_keys(), 1);

    clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
    let pruner = spawn_ledger_pruner(state.ledger.clone(), Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(100)).await;
    pruner.abort();

    assert_eq!(state.ledger.tracked_keys(), 0);
}

/// Sets its flag when dropped.
struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A completion service that never answers in time and records whether
/// its in-flight call was started and later dropped.
#[derive(Debug, Default)]
struct HangingService {
    started: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl CompletionService for HangingService {
    async fn complete(&self, _request: &ChatCompletionRequest) -> doubt_gate::Result<String> {
        let _guard = SetOnDrop(Arc::clone(&self.dropped));
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(String::new())
    }
}

async fn wait_for(flag: &AtomicBool) -> bool {
    for _ in 0..100 {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn client_disconnect_cancels_completion_without_refund() {
    init_tracing();
    let config = Config {
        upstream: UpstreamConfig {
            timeout_ms: 60_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let config = Arc::new(config.into_runtime().unwrap());

    let service = HangingService::default();
    let started = Arc::clone(&service.started);
    let dropped = Arc::clone(&service.dropped);
    let gateway = CompletionGateway::new(Arc::new(service), &config.upstream);
    let ledger = QuotaLedger::new(config.quota);
    let app = AppState::new(Arc::clone(&config), ledger.clone(), Some(gateway));
    let (addr, _shutdown) = start_gateway(app).await;

    let body = valid_body().to_string();
    let request = format!(
        "POST {ENDPOINT} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    assert!(wait_for(&started).await, "completion call never started");
    assert!(!dropped.load(Ordering::SeqCst));

    drop(stream);

    assert!(
        wait_for(&dropped).await,
        "completion call outlived the client connection"
    );
    assert_eq!(ledger.remaining("anonymous", Tier::Anonymous), 9);
}
