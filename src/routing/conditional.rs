//! ETag validators and `If-None-Match` handling.

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};

/// Strong validator for a response body.
pub fn etag_for(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body)))
}

fn opaque_tag(tag: &str) -> &str {
    tag.trim().strip_prefix("W/").unwrap_or(tag.trim())
}

/// Weak comparison of an ETag against an `If-None-Match` value.
pub fn if_none_match_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = opaque_tag(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque_tag(candidate) == etag)
}

/// Tag a successful response and answer a matching conditional request with 304.
pub async fn apply(method: &Method, if_none_match: Option<&str>, response: Response) -> Result<Response> {
    if !response.status().is_success() {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();

    let existing = parts
        .headers
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let (etag, body) = match existing {
        Some(etag) => (etag, body),
        None => {
            let bytes = to_bytes(body, usize::MAX).await.map_err(|e| {
                GatewayError::Internal(format!("Failed to buffer response body: {}", e))
            })?;
            let etag = etag_for(&bytes);
            let value = HeaderValue::from_str(&etag)
                .map_err(|e| GatewayError::Internal(format!("Invalid ETag: {}", e)))?;
            parts.headers.insert(header::ETAG, value);
            (etag, Body::from(bytes))
        }
    };

    Ok(respond(method, if_none_match, parts, body, &etag))
}

fn respond(
    method: &Method,
    if_none_match: Option<&str>,
    mut parts: axum::http::response::Parts,
    body: Body,
    etag: &str,
) -> Response {
    let cacheable = *method == Method::GET || *method == Method::HEAD;
    let matched = if_none_match.is_some_and(|value| if_none_match_matches(value, etag));

    if cacheable && matched {
        parts.status = StatusCode::NOT_MODIFIED;
        parts.headers.remove(header::CONTENT_TYPE);
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(header::TRANSFER_ENCODING);
        return Response::from_parts(parts, Body::empty());
    }

    Response::from_parts(parts, body)
}
