use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::response::RateLimitHeaders;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Accept header could not be properly parsed because of a strict matching process.")]
    MalformedAccept,
    #[error("The version given was unknown or has no registered routes: {0}")]
    UnknownVersion(String),
    #[error("No route matches {0}")]
    NotFound(String),
    #[error("Method {method} is not allowed for this route")]
    MethodNotAllowed { method: Method, allowed: Vec<Method> },
    #[error("Failed to authenticate because of bad credentials or an invalid authorization header.")]
    Unauthorized,
    #[error("Unable to format response according to Accept header: {0}")]
    NotAcceptable(String),
    #[error("You have exceeded your rate limit.")]
    RateLimitExceeded {
        headers: RateLimitHeaders,
        retry_after: u64,
    },
    #[error("Counter store error: {0}")]
    CounterStore(String),
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unknown throttle: {0}")]
    UnknownThrottle(String),
    #[error("Invalid route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Error raised by a route handler with an explicit status.
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        GatewayError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedAccept | GatewayError::UnknownVersion(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CounterStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Http { status, .. } => *status,
            GatewayError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Configuration(_)
            | GatewayError::UnknownThrottle(_)
            | GatewayError::InvalidRoute { .. }
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GatewayError::MalformedAccept => "malformed_accept",
            GatewayError::UnknownVersion(_) => "unknown_version",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::MethodNotAllowed { .. } => "method_not_allowed",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::NotAcceptable(_) => "not_acceptable",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::CounterStore(_) => "service_unavailable",
            GatewayError::Http { .. } => "http_error",
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Configuration(_)
            | GatewayError::UnknownThrottle(_)
            | GatewayError::InvalidRoute { .. } => "configuration_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::CounterStore(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_gateway_error(err: &GatewayError) -> Self {
        Self::new(err.kind(), &err.to_string(), err.status().as_u16())
    }
}

/// `Allow` header value listing `methods`.
pub fn allow_header(methods: &[Method]) -> Option<HeaderValue> {
    let allow = methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    HeaderValue::from_str(&allow).ok()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorResponse::from_gateway_error(&self))).into_response();

        match &self {
            GatewayError::MethodNotAllowed { allowed, .. } => {
                if let Some(value) = allow_header(allowed) {
                    response.headers_mut().insert(header::ALLOW, value);
                }
            }
            GatewayError::RateLimitExceeded {
                headers,
                retry_after,
            } => {
                headers.apply(response.headers_mut());
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            }
            _ => {}
        }

        response
    }
}
