//! Error types and HTTP status code mapping.
//!
//! Every failure the gateway can produce is a [`GateError`] variant. The
//! handler returns these unchanged and the server converts them into JSON
//! responses at the boundary, so no failure leaves without a status code.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The configuration file could not be loaded, parsed, or validated.
    #[error("configuration error: {0}")]
    Config(String),
    /// The completion service credential is not configured.
    #[error("completion service credential is not configured")]
    MissingCredential,
    /// The request used a method other than `POST` or `OPTIONS`.
    #[error("method not allowed")]
    MethodNotAllowed,
    /// The request targeted a path the gateway does not serve.
    #[error("no route for path")]
    NotFound,
    /// One of `subject`, `question`, or `level` is absent or empty.
    #[error("missing required fields")]
    MissingFields,
    /// The question length falls outside the accepted character range.
    #[error("question length {len} is outside the accepted range")]
    InvalidQuestionLength {
        /// Length of the rejected question in characters.
        len: usize,
    },
    /// The request body is not a JSON object of the expected shape.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    /// The request body exceeds the configured size limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The configured maximum body size in bytes.
        limit: u64,
    },
    /// The caller has used up its quota for the current window.
    #[error("rate limit of {limit} requests exceeded")]
    RateLimited {
        /// The limit of the caller's tier.
        limit: u32,
    },
    /// The completion service failed or rejected the call.
    #[error("completion service error: {0}")]
    Upstream(String),
    /// The completion service did not answer within the configured timeout.
    #[error("completion service timed out after {0:?}")]
    UpstreamTimeout(Duration),
    /// The completion service answered with text that is not a valid answer.
    #[error("malformed completion reply: {0}")]
    MalformedUpstream(String),
    /// The in-flight request limit was reached.
    #[error("concurrency limit of {limit} requests reached")]
    ServiceUnavailable {
        /// The configured concurrency limit.
        limit: usize,
    },
    /// An internal error that does not fit other categories.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFields | Self::InvalidQuestionLength { .. } | Self::InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_)
            | Self::MissingCredential
            | Self::Upstream(_)
            | Self::UpstreamTimeout(_)
            | Self::MalformedUpstream(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short description returned to callers alongside `"Failed to solve doubt"`.
    ///
    /// Provider messages stay in the logs; callers only learn which stage failed.
    fn caller_message(&self) -> String {
        match self {
            Self::Upstream(_) => "completion service request failed".into(),
            Self::UpstreamTimeout(after) => {
                format!("completion service timed out after {}ms", after.as_millis())
            }
            Self::MalformedUpstream(_) => "completion service returned an unreadable answer".into(),
            Self::Config(_) => "gateway is misconfigured".into(),
            _ => "internal error".into(),
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body = match &self {
            Self::MissingCredential => serde_json::json!({ "error": "AI service unavailable" }),
            Self::MethodNotAllowed => serde_json::json!({ "error": "Method not allowed" }),
            Self::NotFound => serde_json::json!({ "error": "Not found" }),
            Self::MissingFields => serde_json::json!({ "error": "Missing required fields" }),
            Self::InvalidQuestionLength { .. } => {
                serde_json::json!({ "error": "Invalid question length" })
            }
            Self::InvalidBody(_) => serde_json::json!({ "error": "Invalid JSON body" }),
            Self::BodyTooLarge { .. } => serde_json::json!({ "error": "Request body too large" }),
            Self::RateLimited { .. } => serde_json::json!({
                "error": "Rate limit exceeded",
                "isRateLimited": true,
                "remaining": 0,
            }),
            Self::ServiceUnavailable { .. } => serde_json::json!({ "error": "Server busy" }),
            Self::Config(_)
            | Self::Upstream(_)
            | Self::UpstreamTimeout(_)
            | Self::MalformedUpstream(_)
            | Self::Internal(_) => serde_json::json!({
                "error": "Failed to solve doubt",
                "message": self.caller_message(),
            }),
        };

        let mut response = json_response(status, &body);
        match self {
            Self::MethodNotAllowed => {
                response.headers_mut().insert(
                    hyper::header::ALLOW,
                    hyper::header::HeaderValue::from_static("POST, OPTIONS"),
                );
            }
            Self::RateLimited { limit } => {
                response
                    .headers_mut()
                    .insert("x-ratelimit-limit", limit.into());
                response
                    .headers_mut()
                    .insert("x-ratelimit-remaining", 0u32.into());
            }
            _ => {}
        }
        response
    }
}

/// Builds a response with the given status and a serialized JSON body.
pub(crate) fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::new()))
                .expect("building fallback response must not fail")
        })
}

impl From<hyper::http::Error> for GateError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for GateError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}
