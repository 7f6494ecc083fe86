use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::GatewayError;
use crate::health::{Health, HealthChecker};
use crate::metrics::AdmissionMetrics;
use crate::routing::Dispatcher;
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state containing the dispatcher and request validator
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub validator: RequestValidator,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, validator: RequestValidator) -> Self {
        let health = HealthChecker::new(Arc::clone(dispatcher.rate_limiter().store()));
        Self {
            dispatcher,
            validator,
            health,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub global: AdmissionMetrics,
    pub policies: std::collections::HashMap<String, AdmissionMetrics>,
    pub versions: Vec<String>,
}

/// Fallback handler passing API requests to the dispatcher
pub async fn gateway(State(state): State<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    if !state.validator.is_api_request(&parts) {
        return GatewayError::NotFound(parts.uri.path().to_string()).into_response();
    }

    state.dispatcher.dispatch(Request::from_parts(parts, body)).await
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = if report.status == Health::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let store = state.health.check_counter_store().await;

    if store.is_healthy() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "counter_store": store.backend,
                "versions": state.dispatcher.routes().versions().collect::<Vec<_>>(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "counter_store": store.backend,
                "error": store.error,
            })),
        )
    }
}

/// Admission metrics endpoint
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    let collector = state.dispatcher.metrics();

    Json(MetricsResponse {
        global: collector.get_global_metrics().await,
        policies: collector.get_all_metrics().await,
        versions: state
            .dispatcher
            .routes()
            .versions()
            .map(str::to_string)
            .collect(),
    })
}
