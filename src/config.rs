use std::net::SocketAddr;

use clap::Parser;

use crate::routing::VersionFallback;

#[derive(Debug, Clone, Parser)]
#[command(name = "apigate", version, about = "Versioned API gateway with rate limiting")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL. Counters are kept in memory when unset.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Vendor tree of the Accept media type
    #[arg(long, env = "API_STANDARDS_TREE", default_value = "vnd")]
    pub standards_tree: String,

    /// API subtype of the Accept media type
    #[arg(long, env = "API_SUBTYPE", default_value = "api")]
    pub subtype: String,

    #[arg(long, env = "API_VERSION", default_value = "v1")]
    pub default_version: String,

    #[arg(long, env = "API_DEFAULT_FORMAT", default_value = "json")]
    pub default_format: String,

    /// Reject requests whose Accept header does not name the API media type
    #[arg(long, env = "API_STRICT", default_value_t = false)]
    pub strict: bool,

    /// Path prefix identifying API requests
    #[arg(long, env = "API_PREFIX")]
    pub prefix: Option<String>,

    /// Host identifying API requests
    #[arg(long, env = "API_DOMAIN")]
    pub domain: Option<String>,

    /// Tag successful responses with an ETag unless a route opts out
    #[arg(long, env = "API_CONDITIONAL_REQUEST", default_value_t = true, action = clap::ArgAction::Set)]
    pub conditional_request: bool,

    #[arg(long, env = "API_VERSION_FALLBACK", value_enum, default_value_t = VersionFallback::PointRelease)]
    pub version_fallback: VersionFallback,

    /// Requests per window for unauthenticated callers. 0 disables the throttle.
    #[arg(long, env = "API_UNAUTHENTICATED_LIMIT", default_value_t = 0)]
    pub unauthenticated_limit: u64,

    /// Window length in minutes for unauthenticated callers
    #[arg(long, env = "API_UNAUTHENTICATED_EXPIRES", default_value_t = 1)]
    pub unauthenticated_expires: u64,

    /// Requests per window for authenticated callers. 0 disables the throttle.
    #[arg(long, env = "API_AUTHENTICATED_LIMIT", default_value_t = 0)]
    pub authenticated_limit: u64,

    #[arg(long, env = "API_AUTHENTICATED_EXPIRES", default_value_t = 1)]
    pub authenticated_expires: u64,

    /// Header identifying the caller for rate limiting instead of its address
    #[arg(long, env = "API_LIMITER_HEADER")]
    pub limiter_header: Option<String>,

    /// Read the caller address from X-Forwarded-For / X-Real-IP
    #[arg(long, env = "TRUST_PROXY_HEADERS", default_value_t = false)]
    pub trust_proxy_headers: bool,

    /// Memory counter cleanup interval in seconds
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from command line arguments and environment variables
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn uses_redis(&self) -> bool {
        self.redis_url.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            standards_tree: "vnd".to_string(),
            subtype: "api".to_string(),
            default_version: "v1".to_string(),
            default_format: "json".to_string(),
            strict: false,
            prefix: None,
            domain: None,
            conditional_request: true,
            version_fallback: VersionFallback::PointRelease,
            unauthenticated_limit: 0,
            unauthenticated_expires: 1,
            authenticated_limit: 0,
            authenticated_expires: 1,
            limiter_header: None,
            trust_proxy_headers: false,
            cleanup_interval_secs: 300,
            log_level: "info".to_string(),
        }
    }
}
