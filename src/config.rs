//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::RateLimitingConfig;

/// Prefix of environment variables overriding file settings,
/// e.g. `RATEWARDEN__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting rules
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bearer token guarding the admin endpoint; unset leaves it unmounted
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_token: None,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store holds the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process, single node only
    Memory,
    /// Shared Redis server
    #[default]
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(WardenError::Config(format!("unknown store backend: {}", other))),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl WardenConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file, with `RATEWARDEN__*` environment
    /// variables layered on top.
    ///
    /// The file is parsed as-is so map keys such as API names keep their case.
    /// Environment keys only address struct fields and are matched lowercase.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut document = match path {
            Some(path) => {
                let path = path.as_ref();
                info!(path = %path.display(), "Loading configuration");
                let contents = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&contents).map_err(|e| {
                    WardenError::Config(format!("Failed to parse {}: {}", path.display(), e))
                })?
            }
            None => Value::Null,
        };

        let environment: Value = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        overlay(&mut document, environment);

        if document.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(document)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Merge `top` into `base`, recursing through mappings; any other value in
/// `top` replaces what `base` held.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (_, Value::Mapping(top)) if top.is_empty() => {}
        (Value::Mapping(base), Value::Mapping(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FailurePolicy, LimitLevel, RuleResolver};
    use std::sync::Arc;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.rate_limiting.default.limit_level, LimitLevel::User);
    }

    #[test]
    fn test_from_yaml_sections() {
        let yaml = r#"
server:
  http_addr: 0.0.0.0:9000
store:
  backend: memory
  timeout_ms: 50
rate_limiting:
  store_failure_policy: closed
  default:
    limit_level: ip
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.timeout_ms, 50);
        assert_eq!(config.rate_limiting.store_failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limiting.default.limit_level, LimitLevel::Ip);
        assert_eq!(config.rate_limiting.default.get.max_attempts, 10);
    }

    #[test]
    fn test_from_yaml_rejects_garbage() {
        assert!(matches!(
            WardenConfig::from_yaml("server: [1, 2"),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "store:\n  backend: memory\nrate_limiting:\n  api_gateway: true\n",
        )
        .unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.rate_limiting.api_gateway);
    }

    #[test]
    fn test_load_keeps_api_name_case() {
        let path = std::env::temp_dir().join(format!(
            "ratewarden-case-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
rate_limiting:
  api_limit:
    /Api/Center/user.get: [1, 20]
    User_Get:
      limit_level: api
      rate: [1, 5]
"#,
        )
        .unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(config.rate_limiting.api_limit.contains_key("/Api/Center/user.get"));
        assert!(config.rate_limiting.api_limit.contains_key("User_Get"));

        let mut rules = config.rate_limiting.clone();
        let resolver = RuleResolver::new(Arc::new(rules.clone()));
        assert_eq!(resolver.resolve("GET", "/Api/Center/user.get").max_attempts, 20);

        rules.api_gateway = true;
        let gateway = RuleResolver::new(Arc::new(rules));
        let rule = gateway.resolve("GET", "/gw/v1/center/User.Get");
        assert_eq!(rule.api_name, "User_Get");
        assert_eq!(rule.max_attempts, 5);
        assert_eq!(rule.level, LimitLevel::Api);
    }

    #[test]
    fn test_overlay_replaces_leaves_and_keeps_siblings() {
        let mut base: Value = serde_yaml::from_str(
            "store:\n  backend: memory\n  timeout_ms: 50\nrate_limiting:\n  api_limit:\n    Mixed_Case: [1, 3]\n",
        )
        .unwrap();
        let top: Value = serde_yaml::from_str("store:\n  timeout_ms: 900\nserver:\n  admin_token: t\n").unwrap();

        overlay(&mut base, top);
        let config: WardenConfig = serde_yaml::from_value(base).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout_ms, 900);
        assert_eq!(config.server.admin_token.as_deref(), Some("t"));
        assert!(config.rate_limiting.api_limit.contains_key("Mixed_Case"));
    }

    #[test]
    fn test_overlay_of_nothing_keeps_base() {
        let mut base = Value::Null;
        overlay(&mut base, Value::Mapping(Default::default()));
        assert!(base.is_null());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = WardenConfig::load(None::<&str>).unwrap();
        assert_eq!(config.rate_limiting.error_code, 90429);
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!("Memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("redis".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert!("etcd".parse::<StoreBackend>().is_err());
    }
}
