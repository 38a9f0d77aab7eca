//! Chat-completion client.
//!
//! [`CompletionService`] is the seam between the gateway and whatever
//! produces text. [`OpenAiClient`] implements it against an
//! OpenAI-compatible `/chat/completions` endpoint over hyper, using a
//! rustls connector with the Mozilla root store so that both `https://`
//! and plain `http://` base URLs work.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};

use crate::{GateError, Result};

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A message carrying instructions for the model.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// A message carrying the caller's prompt.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Body of a chat completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    /// Model identifier, e.g. `"gpt-3.5-turbo"`.
    pub model: String,
    /// Conversation so far, system message first.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap in tokens; omitted from the wire when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Something that turns a chat request into one textual reply.
///
/// Implementations make exactly one attempt per call. Transport and
/// provider failures are reported as [`GateError::Upstream`]; a reply
/// envelope that cannot be read is [`GateError::MalformedUpstream`].
#[async_trait]
pub trait CompletionService: Send + Sync + fmt::Debug {
    /// Sends `request` and returns the text of the first choice.
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String>;
}

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Builds a connector for outbound calls, verifying servers against the
/// Mozilla root certificate store.
fn https_connector() -> HttpsConnector {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build()
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client<HttpsConnector, Full<Bytes>>,
    endpoint: hyper::Uri,
    authorization: HeaderValue,
}

impl OpenAiClient {
    /// Creates a client posting to `endpoint` with the given bearer key.
    pub fn new(endpoint: hyper::Uri, api_key: &str) -> Result<Self> {
        let mut authorization = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| GateError::Config("API key contains invalid header characters".into()))?;
        authorization.set_sensitive(true);

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https_connector()),
            endpoint,
            authorization,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        let body = serde_json::to_vec(request)
            .map_err(|e| GateError::Internal(format!("failed to encode completion request: {e}")))?;

        let http_request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(AUTHORIZATION, self.authorization.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = self.client.request(http_request).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| GateError::Upstream(format!("failed to read completion body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiError>(&bytes)
                .map(|api_error| api_error.error.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(GateError::Upstream(format!(
                "provider returned {status}: {message}"
            )));
        }

        let envelope: ChatCompletionResponse = serde_json::from_slice(&bytes).map_err(|e| {
            GateError::MalformedUpstream(format!("unexpected completion envelope: {e}"))
        })?;

        envelope
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GateError::MalformedUpstream("completion contained no choices".into()))
    }
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .field("authorization", &"[REDACTED]")
            .finish()
    }
}
