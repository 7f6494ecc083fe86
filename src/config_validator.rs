use regex::Regex;

use crate::config::Config;
use crate::error::{GatewayError, Result};

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a full gateway configuration
    pub fn validate(config: &Config) -> Result<()> {
        if let Some(url) = &config.redis_url {
            Self::validate_redis_url(url)?;
        }
        Self::validate_bind_address(&config.bind_addr.to_string())?;
        Self::validate_token("Standards tree", &config.standards_tree)?;
        Self::validate_token("Subtype", &config.subtype)?;
        Self::validate_token("Default format", &config.default_format)?;
        Self::validate_version(&config.default_version)?;
        Self::validate_throttle(
            "unauthenticated",
            config.unauthenticated_limit,
            config.unauthenticated_expires,
        )?;
        Self::validate_throttle(
            "authenticated",
            config.authenticated_limit,
            config.authenticated_expires,
        )?;

        if let Some(prefix) = &config.prefix {
            if prefix.trim_matches('/').is_empty() {
                return Err(GatewayError::Validation(
                    "API prefix cannot be empty".to_string(),
                ));
            }
        }

        if config.prefix.is_some() && config.domain.is_some() {
            return Err(GatewayError::Validation(
                "Configure either an API prefix or an API domain, not both".to_string(),
            ));
        }

        if let Some(header) = &config.limiter_header {
            axum::http::HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                GatewayError::Validation(format!("Invalid limiter header '{}'", header))
            })?;
        }

        if config.cleanup_interval_secs == 0 {
            return Err(GatewayError::Validation(
                "Cleanup interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(GatewayError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(GatewayError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<()> {
        if address.is_empty() {
            return Err(GatewayError::Validation(
                "Bind address cannot be empty".to_string(),
            ));
        }

        // Check if it looks like host:port format
        if !address.contains(':') {
            return Err(GatewayError::Validation(
                "Bind address must be in host:port format".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a media type token such as the standards tree or subtype
    pub fn validate_token(field: &str, token: &str) -> Result<()> {
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        if !valid {
            return Err(GatewayError::Validation(format!(
                "{} '{}' is not a valid media type token",
                field, token
            )));
        }

        Ok(())
    }

    /// Validates a version identifier against the Accept version grammar
    pub fn validate_version(version: &str) -> Result<()> {
        let pattern = Regex::new(r"^[A-Za-z0-9]+(?:[.\-][A-Za-z0-9]+)*$")
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if !pattern.is_match(version) {
            return Err(GatewayError::Validation(format!(
                "Version '{}' must be alphanumeric with optional '.' or '-' segments",
                version
            )));
        }

        Ok(())
    }

    /// Validates a built-in throttle. A zero limit disables it.
    pub fn validate_throttle(name: &str, limit: u64, expires: u64) -> Result<()> {
        if limit > 0 && expires == 0 {
            return Err(GatewayError::Validation(format!(
                "The {} throttle needs a window of at least one minute",
                name
            )));
        }

        Ok(())
    }
}
