use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use apigate::accept::{AcceptParser, MediaType};
use apigate::config::Config;
use apigate::config_validator::ConfigValidator;
use apigate::handlers::AppState;
use apigate::key_generator::{KeyGenerator, LimiterStrategy};
use apigate::rate_limit::{CounterStore, MemoryCounterStore, RateLimitHandler, ThrottleRegistry};
use apigate::redis::RedisCounterStore;
use apigate::routing::{Dispatcher, GroupOptions, RouteParams, VersionedRouteTable};
use apigate::server::Server;
use apigate::validation::RequestValidator;
use axum::extract::Request;
use axum::Json;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn list_users(request: Request) -> Json<Value> {
    let version = request
        .extensions()
        .get::<MediaType>()
        .map(|m| m.version.clone())
        .unwrap_or_default();
    Json(json!({ "version": version, "users": [{ "id": 1, "name": "ada" }] }))
}

async fn show_user(request: Request) -> Json<Value> {
    let id = request
        .extensions()
        .get::<RouteParams>()
        .and_then(|p| p.get("id"))
        .unwrap_or_default()
        .to_string();
    Json(json!({ "id": id }))
}

async fn list_users_v2(_request: Request) -> Json<Value> {
    Json(json!({ "data": [{ "id": 1, "name": "ada" }], "meta": { "count": 1 } }))
}

fn build_routes(config: &Config, registry: &ThrottleRegistry) -> apigate::Result<VersionedRouteTable> {
    VersionedRouteTable::builder(registry)
        .prefix(config.prefix.as_deref())
        .domain(config.domain.as_deref())
        .conditional_request(config.conditional_request)
        .version_fallback(config.version_fallback)
        .version(&["v1"], GroupOptions::new(), |api| {
            api.get("/users", list_users).name("users.index");
            api.get("/users/{id}", show_user)
                .name("users.show")
                .constraint("id", "[0-9]+");
        })
        .version(&["v2"], GroupOptions::new(), |api| {
            api.get("/users", list_users_v2).name("users.index").limit(60, 1);
            api.get("/users/{id}", show_user).constraint("id", "[0-9]+");
        })
        .build()
}

async fn counter_store(config: &Config) -> Result<Arc<dyn CounterStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisCounterStore::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect counter store: {}", e))?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("REDIS_URL not set, keeping rate limit counters in memory");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("apigate={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing::info!("Starting API gateway");
    tracing::info!(
        "Configuration: bind_addr={}, counter_store={}, default_version={}, strict={}",
        config.bind_addr,
        if config.uses_redis() { "redis" } else { "memory" },
        config.default_version,
        config.strict
    );

    let registry = ThrottleRegistry::from_config(&config);
    let routes = build_routes(&config, &registry)
        .map_err(|e| anyhow::anyhow!("Failed to build routes: {}", e))?;

    let strategy = match &config.limiter_header {
        Some(header) => LimiterStrategy::Header(header.to_ascii_lowercase()),
        None => LimiterStrategy::ClientIp,
    };
    let rate_limiter = RateLimitHandler::new(counter_store(&config).await?, Arc::new(registry))
        .with_key_generator(KeyGenerator::new("apigate", strategy));

    let parser = AcceptParser::new(
        &config.standards_tree,
        &config.subtype,
        &config.default_version,
        &config.default_format,
    )
    .map_err(|e| anyhow::anyhow!("Failed to build Accept parser: {}", e))?;

    let dispatcher = Dispatcher::new(parser, Arc::new(routes), rate_limiter)
        .strict(config.strict)
        .trust_proxy_headers(config.trust_proxy_headers);

    let state = Arc::new(AppState::new(
        Arc::new(dispatcher),
        RequestValidator::from_config(&config),
    ));

    // Create and run the server
    let server = Server::new(
        state,
        config.bind_addr,
        Duration::from_secs(config.cleanup_interval_secs),
    );

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
