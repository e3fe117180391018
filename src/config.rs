//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::validate_rate_limit;

/// Prefix for environment variable overrides, e.g. `TURNSTILE__LIMITER__RATE_LIMIT`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter options
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// A rate limit as written in configuration.
///
/// Anything that is not a number is kept so it can be reported as an
/// invalid rate limit instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateLimitSetting {
    Number(f64),
    Other(serde_yaml::Value),
}

/// Limiter options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per 60-second window
    #[serde(default)]
    pub rate_limit: Option<RateLimitSetting>,

    /// Request property identifying the caller (default: `ip`)
    #[serde(default)]
    pub identity_property: Option<String>,

    /// Request header identifying the caller
    #[serde(default)]
    pub identity_header: Option<String>,

    /// Name of a registered rejection handler
    #[serde(default)]
    pub rejection_handler: Option<String>,

    /// Name of a registered store accessor
    #[serde(default)]
    pub store_accessor: Option<String>,

    /// Name of a registered store mutator
    #[serde(default)]
    pub store_mutator: Option<String>,

    /// Forget identities once their usage has decayed to zero
    #[serde(default)]
    pub prune_settled: bool,
}

impl LimiterConfig {
    /// The validated rate limit.
    pub fn rate_limit_value(&self) -> Result<f64> {
        match &self.rate_limit {
            None => Err(TurnstileError::InvalidRateLimit(
                "rate_limit is required".to_string(),
            )),
            Some(RateLimitSetting::Number(n)) => validate_rate_limit(*n),
            Some(RateLimitSetting::Other(value)) => Err(TurnstileError::InvalidRateLimit(format!(
                "rate_limit must be a number, got {:?}",
                value
            ))),
        }
    }
}

/// Shorthand: a bare number is the rate limit.
impl From<f64> for LimiterConfig {
    fn from(rate_limit: f64) -> Self {
        Self {
            rate_limit: Some(RateLimitSetting::Number(rate_limit)),
            ..Default::default()
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from a file, with environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.limiter.rate_limit, None);
        assert!(!config.limiter.prune_settled);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:3000"
limiter:
  rate_limit: 120
  identity_header: x-api-key
  prune_settled: true
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 3000);
        assert_eq!(config.limiter.rate_limit_value().unwrap(), 120.0);
        assert_eq!(config.limiter.identity_header.as_deref(), Some("x-api-key"));
        assert!(config.limiter.prune_settled);
    }

    #[test]
    fn test_shorthand() {
        let config = LimiterConfig::from(60.0);
        assert_eq!(config.rate_limit_value().unwrap(), 60.0);
        assert_eq!(config.identity_property, None);
    }

    #[test]
    fn test_missing_rate_limit() {
        let config = TurnstileConfig::from_yaml("limiter: {}").unwrap();
        assert!(matches!(
            config.limiter.rate_limit_value(),
            Err(TurnstileError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_non_numeric_rate_limit() {
        let config = TurnstileConfig::from_yaml("limiter:\n  rate_limit: lots\n").unwrap();
        assert!(matches!(
            config.limiter.rate_limit,
            Some(RateLimitSetting::Other(_))
        ));
        assert!(matches!(
            config.limiter.rate_limit_value(),
            Err(TurnstileError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_non_positive_rate_limit() {
        for rate in [0.0, -1.0] {
            assert!(matches!(
                LimiterConfig::from(rate).rate_limit_value(),
                Err(TurnstileError::InvalidRateLimit(_))
            ));
        }
    }

    #[test]
    fn test_invalid_yaml() {
        let result = TurnstileConfig::from_yaml("server: [");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_load_with_env_override() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiter:\n  rate_limit: 60\n  identity_header: x-api-key\n",
        )
        .unwrap();
        let path_str = path.to_str().unwrap();

        let config = TurnstileConfig::load(path_str).unwrap();
        assert_eq!(config.limiter.rate_limit_value().unwrap(), 60.0);

        std::env::set_var("TURNSTILE__LIMITER__RATE_LIMIT", "5");
        let config = TurnstileConfig::load(path_str).unwrap();
        assert_eq!(config.limiter.rate_limit_value().unwrap(), 5.0);
        assert_eq!(config.limiter.identity_header.as_deref(), Some("x-api-key"));

        // non-numeric overrides surface as an invalid rate limit
        std::env::set_var("TURNSTILE__LIMITER__RATE_LIMIT", "lots");
        let config = TurnstileConfig::load(path_str).unwrap();
        assert!(matches!(
            config.limiter.rate_limit_value(),
            Err(TurnstileError::InvalidRateLimit(_))
        ));

        std::env::remove_var("TURNSTILE__LIMITER__RATE_LIMIT");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = TurnstileConfig::load("/nonexistent/turnstile.yaml");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
