//! Request pipeline: routing, admission, and response assembly.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{Instrument, debug, info, warn};

use crate::completion::OpenAiClient;
use crate::config::RuntimeConfig;
use crate::error::json_response;
use crate::gateway::{CompletionGateway, DoubtAnswer};
use crate::quota::QuotaLedger;
use crate::validation::{self, DoubtRequest};
use crate::{GateError, Result, identity};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces.
pub type ResponseBody = Full<Bytes>;

/// Value reported in the `source` field of successful answers.
const ANSWER_SOURCE: &str = "openai";

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a request needs, constructed once at startup.
///
/// `gateway` is `None` when no completion credential is configured; the
/// endpoint then answers every question with "AI service unavailable".
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub ledger: QuotaLedger,
    pub gateway: Option<CompletionGateway>,
}

impl AppState {
    /// Assembles state from already-built parts.
    pub fn new(
        config: Arc<RuntimeConfig>,
        ledger: QuotaLedger,
        gateway: Option<CompletionGateway>,
    ) -> Self {
        Self {
            config,
            ledger,
            gateway,
        }
    }

    /// Builds the production state: a fresh ledger with the configured
    /// policy and, when `api_key` is present, an [`OpenAiClient`]-backed
    /// gateway.
    pub fn from_config(config: Arc<RuntimeConfig>, api_key: Option<&str>) -> Result<Self> {
        let ledger = QuotaLedger::new(config.quota);
        let gateway = api_key
            .map(|key| {
                OpenAiClient::new(config.upstream.endpoint.clone(), key).map(|client| {
                    CompletionGateway::new(Arc::new(client), &config.upstream)
                })
            })
            .transpose()?;

        Ok(Self::new(config, ledger, gateway))
    }
}

/// Processes a single inbound request through the doubt-solving pipeline.
///
/// The pipeline performs the following steps in order:
///
/// 1. **Routing**: Requests for any path other than the configured
///    endpoint receive 404.
/// 2. **Method check**: `OPTIONS` is answered as a CORS preflight; any
///    method other than `POST` receives 405.
/// 3. **Credential check**: Without a completion credential the request
///    is answered "AI service unavailable" before anything else is read.
/// 4. **Body**: The body is collected up to `max_body_size` (413 beyond)
///    and parsed as JSON (400 on failure).
/// 5. **Validation**: Missing fields or an out-of-range question length
///    receive 400. No quota is consumed.
/// 6. **Identification**: The caller is keyed by user id, else the
///    `X-Forwarded-For` value, else the shared anonymous bucket.
/// 7. **Admission**: One unit of the caller's quota is consumed. An
///    exhausted caller receives 429 and the completion service is not called.
/// 8. **Completion**: The gateway asks the completion service once. The
///    consumed quota unit is kept whatever the outcome.
pub async fn handle_request<B>(
    req: Request<B>,
    state: &AppState,
    client_addr: SocketAddr,
) -> Result<Response<ResponseBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        if uri.path() != state.config.path {
            debug!("no route for path");
            return Err(GateError::NotFound);
        }

        match method {
            Method::OPTIONS => return Ok(preflight_response()),
            Method::POST => {}
            _ => {
                warn!("method not allowed");
                return Err(GateError::MethodNotAllowed);
            }
        }

        let Some(gateway) = state.gateway.as_ref() else {
            warn!("completion credential is not configured, refusing request");
            return Err(GateError::MissingCredential);
        };

        let origin = identity::client_origin(req.headers()).map(str::to_owned);
        let payload = read_json_body(req, state.config.max_body_size).await?;

        let doubt = validation::validate(&payload).inspect_err(|e| {
            warn!(error = %e, "request failed validation");
        })?;

        let identifier = identity::resolve_identifier(payload.caller_id(), origin.as_deref());
        let tier = payload.tier();
        let limit = state.ledger.policy().limit(tier);

        let admission = state.ledger.check_and_consume(&identifier, tier);
        if !admission.allowed {
            warn!(
                identifier = %identifier,
                tier = tier.as_str(),
                limit,
                "rate limit exceeded"
            );
            return Err(GateError::RateLimited { limit });
        }

        info!(
            identifier = %identifier,
            tier = tier.as_str(),
            remaining = admission.remaining,
            subject = %doubt.subject,
            "request admitted"
        );

        let answer = gateway.solve(&doubt).await?;
        Ok(success_response(&answer, admission.remaining, limit))
    }
    .instrument(span)
    .await
}

/// Runs [`handle_request`] and turns any error into its HTTP response,
/// adding CORS headers either way.
pub async fn respond<B>(
    req: Request<B>,
    state: &AppState,
    client_addr: SocketAddr,
) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let mut response = handle_request(req, state, client_addr)
        .await
        .unwrap_or_else(|e| e.into_response());
    apply_cors(response.headers_mut(), &state.config.allowed_origin);
    response
}

/// Adds the CORS headers the browser client needs.
pub fn apply_cors(headers: &mut HeaderMap, allowed_origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allowed_origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
}

/// Returns `true` if the `Content-Length` header value exceeds `max_bytes`.
///
/// Returns `false` if no `Content-Length` is present or the value is
/// unparseable; the collected length is checked again afterwards.
fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .is_some_and(|len| len > max_bytes)
}

/// Collects at most `limit` bytes of the body and parses them as a
/// [`DoubtRequest`].
async fn read_json_body<B>(req: Request<B>, limit: u64) -> Result<DoubtRequest>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    if content_length_exceeds(req.headers(), limit) {
        warn!(limit, "declared body size exceeds limit");
        return Err(GateError::BodyTooLarge { limit });
    }

    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
    let bytes = Limited::new(req.into_body(), limit_usize)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                warn!(limit, "body exceeded size limit while streaming");
                GateError::BodyTooLarge { limit }
            } else {
                GateError::InvalidBody(format!("failed to read body: {e}"))
            }
        })?
        .to_bytes();

    serde_json::from_slice(&bytes).map_err(|e| {
        warn!(error = %e, "request body is not valid JSON");
        GateError::InvalidBody(e.to_string())
    })
}

fn preflight_response() -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    response.headers_mut().insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

fn success_response(answer: &DoubtAnswer, remaining: u32, limit: u32) -> Response<ResponseBody> {
    let body = serde_json::json!({
        "success": true,
        "solution": answer,
        "remaining": remaining,
        "source": ANSWER_SOURCE,
    });

    let mut response = json_response(StatusCode::OK, &body);
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", limit.into());
    headers.insert("x-ratelimit-remaining", remaining.into());
    response
}
