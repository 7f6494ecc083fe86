use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{middleware, Router};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::handlers::{gateway, health_check, metrics, readiness_check, SharedState};
use crate::middleware::logging_middleware;
use crate::rate_limit::CounterStore;

/// Operational endpoints plus the gateway as fallback for everything else.
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .fallback(gateway)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    store: Arc<dyn CounterStore>,
    cleanup_interval: Duration,
}

impl Server {
    pub fn new(state: SharedState, bind_addr: SocketAddr, cleanup_interval: Duration) -> Self {
        let store = Arc::clone(state.dispatcher.rate_limiter().store());
        Self {
            app: create_app(state),
            bind_addr,
            store,
            cleanup_interval,
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!("API gateway listening on {}", self.bind_addr);
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        let cleanup = tokio::spawn(purge_expired_counters(
            Arc::clone(&self.store),
            self.cleanup_interval,
        ));

        // Run server with graceful shutdown
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        cleanup.abort();
        Ok(())
    }
}

async fn purge_expired_counters(store: Arc<dyn CounterStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(store = store.name(), purged, "Purged expired counters"),
            Err(e) => warn!(store = store.name(), error = %e, "Failed to purge expired counters"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
