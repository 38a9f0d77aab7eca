//! Shared test infrastructure for integration tests.
//!
//! Provides a throwaway HTTP server impersonating the completion service,
//! state builders wired to it, request constructors, and body helpers
//! used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use doubt_gate::{
    AppState, CompletionGateway, Config, ManualClock, OpenAiClient, QuotaLedger, ResponseBody,
    RuntimeConfig, UpstreamConfig,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Endpoint path served by the gateway under test.
pub const ENDPOINT: &str = "/api/solve-doubt";

/// Credential handed to the gateway under test.
pub const TEST_API_KEY: &str = "sk-test-key";

/// A well-formed answer as the model would write it.
pub const ANSWER_JSON: &str = r#"{"explanation":"Photosynthesis turns light into chemical energy.","example":"A leaf in sunlight produces glucose.","examTip":"Write the balanced equation first."}"#;

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Wraps `content` in a chat completion envelope.
pub fn completion_envelope(content: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 },
    })
    .to_string()
}

/// A running fake completion service.
pub struct FakeCompletion {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    last_request: Arc<std::sync::Mutex<Option<serde_json::Value>>>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeCompletion {
    /// Number of completion calls received so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Body of the most recent completion call.
    pub fn last_request(&self) -> Option<serde_json::Value> {
        self.last_request.lock().unwrap().clone()
    }

    /// Base URL to configure the gateway with.
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }
}

/// Starts a fake completion service that answers every call with the given
/// status and body after `delay`.
pub async fn start_completion_backend_with_delay(
    status: StatusCode,
    body: String,
    delay: Duration,
) -> FakeCompletion {
    let (tx, rx) = oneshot::channel::<()>();
    let hits = Arc::new(AtomicUsize::new(0));
    let last_request = Arc::new(std::sync::Mutex::new(None));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind fake completion service");
    let addr = listener.local_addr().unwrap();

    let body = Bytes::from(body);
    let task_hits = Arc::clone(&hits);
    let task_last = Arc::clone(&last_request);

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let body = body.clone();
                    let hits = Arc::clone(&task_hits);
                    let last = Arc::clone(&task_last);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let body = body.clone();
                        let hits = Arc::clone(&hits);
                        let last = Arc::clone(&last);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            let bytes = req.into_body().collect().await?.to_bytes();
                            *last.lock().unwrap() = serde_json::from_slice(&bytes).ok();
                            tokio::time::sleep(delay).await;
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(body))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    FakeCompletion {
        addr,
        hits,
        last_request,
        _shutdown: tx,
    }
}

/// Starts a fake completion service that replies `content` as the model's
/// message.
pub async fn start_completion_backend(content: &str) -> FakeCompletion {
    start_completion_backend_with_delay(
        StatusCode::OK,
        completion_envelope(content),
        Duration::ZERO,
    )
    .await
}

/// Builds a `RuntimeConfig` pointing at the fake completion service.
pub fn test_config(backend: &FakeCompletion) -> Arc<RuntimeConfig> {
    test_config_with(backend, |_| {})
}

/// Builds a `RuntimeConfig` pointing at the fake completion service after
/// letting `customize` adjust the raw config.
pub fn test_config_with(
    backend: &FakeCompletion,
    customize: impl FnOnce(&mut Config),
) -> Arc<RuntimeConfig> {
    let mut config = Config {
        upstream: UpstreamConfig {
            base_url: backend.base_url(),
            ..Default::default()
        },
        ..Default::default()
    };
    customize(&mut config);
    Arc::new(config.into_runtime().expect("test config must be valid"))
}

/// Builds state with a credential and a ledger on the system clock.
pub fn test_state(config: Arc<RuntimeConfig>) -> AppState {
    AppState::from_config(config, Some(TEST_API_KEY)).expect("test state must build")
}

/// Builds state with a credential and a ledger driven by `clock`.
pub fn test_state_with_clock(config: Arc<RuntimeConfig>, clock: ManualClock) -> AppState {
    let ledger = QuotaLedger::with_clock(config.quota, Arc::new(clock));
    let client = OpenAiClient::new(config.upstream.endpoint.clone(), TEST_API_KEY)
        .expect("test client must build");
    let gateway = CompletionGateway::new(Arc::new(client), &config.upstream);
    AppState::new(config, ledger, Some(gateway))
}

/// Builds state without a credential.
pub fn test_state_without_credential(config: Arc<RuntimeConfig>) -> AppState {
    AppState::from_config(config, None).expect("test state must build")
}

/// A valid request body with the given question.
pub fn doubt_body(question: &str) -> serde_json::Value {
    serde_json::json!({
        "subject": "Biology",
        "question": question,
        "level": "Class 10",
    })
}

/// A valid anonymous request body.
pub fn valid_body() -> serde_json::Value {
    doubt_body("How does photosynthesis work?")
}

/// A valid request body for a logged-in user.
pub fn logged_in_body(user_id: &str) -> serde_json::Value {
    let mut body = valid_body();
    body["userId"] = user_id.into();
    body["isLoggedIn"] = true.into();
    body
}

/// Builds a POST to the endpoint carrying `body` as JSON.
pub fn post_json(body: &serde_json::Value) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::POST)
        .uri(ENDPOINT)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Collects a response body and parses it as JSON.
pub async fn body_json(resp: Response<ResponseBody>) -> serde_json::Value {
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("failed to collect response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body must be JSON")
}
