use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Tags each request with an `x-request-id` (reusing the caller's when valid)
/// and logs the request and its outcome under `apigate::middleware`.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let peer = get_client_ip(request.headers(), request.extensions(), false);

    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .cloned()
        .unwrap_or_else(new_request_id);
    request
        .headers_mut()
        .insert(HeaderName::from_static(X_REQUEST_ID), request_id.clone());
    let id = request_id.to_str().unwrap_or_default().to_string();

    info!(
        target: "apigate::middleware",
        request_id = %id,
        method = %method,
        uri = %uri,
        peer = %peer,
        "Incoming request"
    );

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(HeaderName::from_static(X_REQUEST_ID), request_id);

    info!(
        target: "apigate::middleware",
        request_id = %id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

fn new_request_id() -> HeaderValue {
    // A hyphenated uuid is always a valid header value.
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Caller address used as the default rate limit identity.
///
/// `X-Forwarded-For` (first hop) and `X-Real-IP` are only consulted when
/// `trust_forwarded` is set; otherwise the socket address wins.
pub fn get_client_ip(headers: &HeaderMap, extensions: &Extensions, trust_forwarded: bool) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let forwarded = trust_forwarded
        .then(|| {
            header("x-forwarded-for")
                .and_then(|chain| chain.split(',').next())
                .map(str::trim)
                .or_else(|| header("x-real-ip"))
        })
        .flatten();
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .or_else(|| extensions.get::<SocketAddr>().copied())
        .map_or_else(|| "unknown".to_string(), |addr| addr.ip().to_string())
}
