//! Rate-limit key resolution.
//!
//! A caller is keyed by its user id when the identity collaborator supplies
//! one, otherwise by the network origin reported in `X-Forwarded-For`, and
//! otherwise by a single bucket shared by every unidentifiable caller.

use hyper::header::HeaderMap;

/// Identifier shared by callers with neither a user id nor an origin header.
pub const ANONYMOUS_IDENTIFIER: &str = "anonymous";

/// Header carrying the caller's network origin, as set by the fronting proxy.
pub const ORIGIN_HEADER: &str = "x-forwarded-for";

/// Picks the rate-limit key for a request.
///
/// Empty strings count as absent. Values are otherwise used verbatim; no
/// format check is made on either input.
pub fn resolve_identifier(caller_id: Option<&str>, origin: Option<&str>) -> String {
    caller_id
        .filter(|id| !id.is_empty())
        .or_else(|| origin.filter(|o| !o.is_empty()))
        .unwrap_or(ANONYMOUS_IDENTIFIER)
        .to_owned()
}

/// Returns the raw `X-Forwarded-For` value, if present and readable.
pub fn client_origin(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ORIGIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
