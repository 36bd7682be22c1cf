//! Rate limit rules configuration and resolution.
//!
//! This module holds the typed `rate_limiting` configuration section and the
//! [`RuleResolver`] that maps a request's method and path to a [`RateRule`].
//! Resolution falls through per-API override, per-method default, and finally
//! the GET default, so partial configuration is never an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, WardenError};

/// Index of the path segment carrying the API name in gateway mode.
///
/// `/gateway/v1/center/<api.name>` splits into `["", "gateway", "v1", "center", "<api.name>"]`.
pub const GATEWAY_API_SEGMENT: usize = 4;

/// The axis along which requesters are told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitLevel {
    /// One counter per route, shared by everyone
    Api,
    /// Route + user + IP + device id
    Device,
    /// Route + user + IP
    User,
    /// Route + IP
    Ip,
}

impl std::fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LimitLevel::Api => "api",
            LimitLevel::Device => "device",
            LimitLevel::User => "user",
            LimitLevel::Ip => "ip",
        };
        f.write_str(name)
    }
}

/// Unit in which window lengths are written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayUnit {
    #[default]
    Second,
    Minute,
}

impl DecayUnit {
    /// Convert a window length in this unit to seconds.
    pub fn to_seconds(&self, units: u64) -> u64 {
        match self {
            DecayUnit::Second => units,
            DecayUnit::Minute => units.saturating_mul(60),
        }
    }
}

/// A `[window_units, max_attempts]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct RateSpec {
    pub window_units: u64,
    pub max_attempts: u64,
}

impl RateSpec {
    pub const fn new(window_units: u64, max_attempts: u64) -> Self {
        Self {
            window_units,
            max_attempts,
        }
    }
}

impl From<(u64, u64)> for RateSpec {
    fn from((window_units, max_attempts): (u64, u64)) -> Self {
        Self::new(window_units, max_attempts)
    }
}

impl From<RateSpec> for (u64, u64) {
    fn from(spec: RateSpec) -> Self {
        (spec.window_units, spec.max_attempts)
    }
}

/// A per-API override.
///
/// Written either as a bare pair or as a map that also picks a limiting level:
///
/// ```yaml
/// /api/center/demo1: [1, 20]
/// /api/center/demo2:
///   limit_level: api
///   rate: [1, 20]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiLimit {
    Rate(RateSpec),
    Leveled {
        #[serde(default)]
        limit_level: Option<LimitLevel>,
        rate: RateSpec,
    },
}

impl ApiLimit {
    fn rate(&self) -> RateSpec {
        match self {
            ApiLimit::Rate(rate) | ApiLimit::Leveled { rate, .. } => *rate,
        }
    }

    fn level(&self) -> Option<LimitLevel> {
        match self {
            ApiLimit::Rate(_) => None,
            ApiLimit::Leveled { limit_level, .. } => *limit_level,
        }
    }
}

/// What to do with a request when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through without quota headers
    #[default]
    Open,
    /// Reject the request with 503
    Closed,
}

/// Defaults applied when no per-API override matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    /// Limiting level used unless an override names its own
    #[serde(default = "default_limit_level")]
    pub limit_level: LimitLevel,

    /// Request parameter carrying the device identifier
    #[serde(default = "default_udid_name")]
    pub udid_name: String,

    /// Default for GET and any verb without its own bucket
    #[serde(default = "default_get")]
    pub get: RateSpec,

    /// Default for POST
    #[serde(default = "default_post")]
    pub post: RateSpec,

    /// Extra per-verb buckets, keyed by lowercase verb
    #[serde(default)]
    pub methods: HashMap<String, RateSpec>,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            limit_level: default_limit_level(),
            udid_name: default_udid_name(),
            get: default_get(),
            post: default_post(),
            methods: HashMap::new(),
        }
    }
}

fn default_limit_level() -> LimitLevel {
    LimitLevel::User
}

fn default_udid_name() -> String {
    "mid".to_string()
}

fn default_get() -> RateSpec {
    RateSpec::new(1, 10)
}

fn default_post() -> RateSpec {
    RateSpec::new(2, 1)
}

/// The `rate_limiting` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Unit of every window length below
    #[serde(default)]
    pub decay_unit: DecayUnit,

    /// Fallback limits
    #[serde(default)]
    pub default: DefaultLimits,

    /// Take the API name from a fixed path segment instead of the whole path
    #[serde(default)]
    pub api_gateway: bool,

    /// Per-API overrides keyed by API name
    #[serde(default)]
    pub api_limit: HashMap<String, ApiLimit>,

    /// Numeric code placed in rejection bodies
    #[serde(default = "default_error_code")]
    pub error_code: i64,

    /// Message placed in rejection bodies
    #[serde(default = "default_error_message")]
    pub error_message: String,

    /// HTTP status of rejection responses
    #[serde(default = "default_rejection_status")]
    pub rejection_status: u16,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub store_failure_policy: FailurePolicy,

    /// Proxy addresses whose `x-real-ip` / `x-forwarded-for` headers are believed
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            decay_unit: DecayUnit::default(),
            default: DefaultLimits::default(),
            api_gateway: false,
            api_limit: HashMap::new(),
            error_code: default_error_code(),
            error_message: default_error_message(),
            rejection_status: default_rejection_status(),
            store_failure_policy: FailurePolicy::default(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_error_code() -> i64 {
    90429
}

fn default_error_message() -> String {
    "Too many requests, please try again later.".to_string()
}

fn default_rejection_status() -> u16 {
    200
}

impl RateLimitingConfig {
    /// Load the section from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit config: {}", e)))
    }
}

/// The limit that applies to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    /// The API name the rule was looked up under
    pub api_name: String,
    /// Window length in configured decay units
    pub window_units: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Attempts allowed per window
    pub max_attempts: u64,
    /// How requesters are told apart
    pub level: LimitLevel,
}

/// Maps a request's method and path to its [`RateRule`].
#[derive(Debug, Clone)]
pub struct RuleResolver {
    config: Arc<RateLimitingConfig>,
}

impl RuleResolver {
    pub fn new(config: Arc<RateLimitingConfig>) -> Self {
        Self { config }
    }

    /// Resolve the rule for a request.
    pub fn resolve(&self, method: &str, path: &str) -> RateRule {
        let api_name = self.api_name(path);
        let api_limit = self.config.api_limit.get(&api_name);

        let (rate, level) = match api_limit {
            Some(limit) => (
                limit.rate(),
                limit.level().unwrap_or(self.config.default.limit_level),
            ),
            None => (self.method_default(method), self.config.default.limit_level),
        };

        trace!(
            api = %api_name,
            overridden = api_limit.is_some(),
            window_units = rate.window_units,
            max_attempts = rate.max_attempts,
            level = %level,
            "Resolved rate rule"
        );

        RateRule {
            window_seconds: self.config.decay_unit.to_seconds(rate.window_units),
            window_units: rate.window_units,
            max_attempts: rate.max_attempts,
            level,
            api_name,
        }
    }

    /// Derive the API name used as the override lookup key.
    ///
    /// In gateway mode this is the segment at [`GATEWAY_API_SEGMENT`] with dots
    /// replaced by underscores. Paths too short to carry that segment fall back
    /// to the whole path.
    pub fn api_name(&self, path: &str) -> String {
        if !self.config.api_gateway {
            return path.to_string();
        }

        match path.split('/').nth(GATEWAY_API_SEGMENT) {
            Some(segment) if !segment.is_empty() => segment.replace('.', "_"),
            _ => path.to_string(),
        }
    }

    fn method_default(&self, method: &str) -> RateSpec {
        let verb = method.to_ascii_lowercase();
        match verb.as_str() {
            "post" => self.config.default.post,
            "get" => self.config.default.get,
            other => self
                .config
                .default
                .methods
                .get(other)
                .copied()
                .unwrap_or(self.config.default.get),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(yaml: &str) -> RuleResolver {
        RuleResolver::new(Arc::new(RateLimitingConfig::from_yaml(yaml).unwrap()))
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RateLimitingConfig::default();
        assert_eq!(config.decay_unit, DecayUnit::Second);
        assert_eq!(config.default.limit_level, LimitLevel::User);
        assert_eq!(config.default.udid_name, "mid");
        assert_eq!(config.default.get, RateSpec::new(1, 10));
        assert_eq!(config.default.post, RateSpec::new(2, 1));
        assert_eq!(config.error_code, 90429);
        assert!(!config.api_gateway);
        assert_eq!(config.store_failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
decay_unit: minute
default:
  limit_level: ip
  udid_name: device
  get: [1, 30]
  post: [5, 2]
  methods:
    delete: [10, 1]
api_gateway: true
api_limit:
  demo_api_demo1: [1, 20]
  demo_api_demo2:
    limit_level: api
    rate: [1, 20]
error_code: 42
store_failure_policy: closed
"#;
        let config = RateLimitingConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.decay_unit, DecayUnit::Minute);
        assert_eq!(config.default.limit_level, LimitLevel::Ip);
        assert_eq!(config.default.methods["delete"], RateSpec::new(10, 1));
        assert_eq!(config.api_limit["demo_api_demo1"], ApiLimit::Rate(RateSpec::new(1, 20)));
        assert_eq!(
            config.api_limit["demo_api_demo2"],
            ApiLimit::Leveled {
                limit_level: Some(LimitLevel::Api),
                rate: RateSpec::new(1, 20),
            }
        );
        assert_eq!(config.error_code, 42);
        assert_eq!(config.store_failure_policy, FailurePolicy::Closed);
    }

    #[test]
    fn test_parse_rejects_bad_rate() {
        let yaml = r#"
api_limit:
  /broken: [1]
"#;
        assert!(matches!(
            RateLimitingConfig::from_yaml(yaml),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_trusted_proxies_parse_as_addresses() {
        assert!(RateLimitingConfig::default().trusted_proxies.is_empty());

        let config = RateLimitingConfig::from_yaml("trusted_proxies: [10.0.0.254, \"::1\"]\n").unwrap();
        assert_eq!(
            config.trusted_proxies,
            vec!["10.0.0.254".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );

        assert!(RateLimitingConfig::from_yaml("trusted_proxies: [lb.internal]\n").is_err());
    }

    #[test]
    fn test_decay_unit_conversion() {
        assert_eq!(DecayUnit::Second.to_seconds(7), 7);
        assert_eq!(DecayUnit::Minute.to_seconds(2), 120);
        assert_eq!(DecayUnit::Minute.to_seconds(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_method_defaults() {
        let resolver = resolver("{}");

        let rule = resolver.resolve("GET", "/users");
        assert_eq!((rule.window_seconds, rule.max_attempts), (1, 10));
        assert_eq!(rule.level, LimitLevel::User);

        let rule = resolver.resolve("post", "/users");
        assert_eq!((rule.window_seconds, rule.max_attempts), (2, 1));

        // Verbs without their own bucket share the GET default
        let rule = resolver.resolve("PUT", "/users");
        assert_eq!((rule.window_seconds, rule.max_attempts), (1, 10));
    }

    #[test]
    fn test_extra_method_bucket() {
        let resolver = resolver(
            r#"
default:
  methods:
    delete: [30, 3]
"#,
        );
        let rule = resolver.resolve("DELETE", "/users/1");
        assert_eq!((rule.window_units, rule.max_attempts), (30, 3));
    }

    #[test]
    fn test_api_override_takes_precedence() {
        let resolver = resolver(
            r#"
api_limit:
  /api/center/demo_api_demo1: [1, 20]
  /api/center/demo_api_demo2:
    limit_level: api
    rate: [3, 5]
"#,
        );

        let rule = resolver.resolve("POST", "/api/center/demo_api_demo1");
        assert_eq!((rule.window_seconds, rule.max_attempts), (1, 20));
        assert_eq!(rule.level, LimitLevel::User);

        let rule = resolver.resolve("GET", "/api/center/demo_api_demo2");
        assert_eq!((rule.window_seconds, rule.max_attempts), (3, 5));
        assert_eq!(rule.level, LimitLevel::Api);

        let rule = resolver.resolve("GET", "/api/center/other");
        assert_eq!(rule.max_attempts, 10);
    }

    #[test]
    fn test_leveled_override_without_level_uses_default_level() {
        let resolver = resolver(
            r#"
default:
  limit_level: device
api_limit:
  /x:
    rate: [1, 2]
"#,
        );
        assert_eq!(resolver.resolve("GET", "/x").level, LimitLevel::Device);
    }

    #[test]
    fn test_minute_unit_scales_window() {
        let resolver = resolver("decay_unit: minute\n");
        let rule = resolver.resolve("POST", "/anything");
        assert_eq!(rule.window_units, 2);
        assert_eq!(rule.window_seconds, 120);
    }

    #[test]
    fn test_gateway_api_name_extraction() {
        let resolver = resolver("api_gateway: true\n");
        assert_eq!(resolver.api_name("/gateway/v1/center/user.profile.get"), "user_profile_get");
        assert_eq!(resolver.api_name("/gateway/v1/center/demo/extra"), "demo");
    }

    #[test]
    fn test_gateway_short_path_falls_back_to_whole_path() {
        let resolver = resolver("api_gateway: true\n");
        assert_eq!(resolver.api_name("/too/short"), "/too/short");
        assert_eq!(resolver.api_name("/a/b/c/"), "/a/b/c/");
        assert_eq!(resolver.api_name(""), "");
    }

    #[test]
    fn test_gateway_override_lookup() {
        let resolver = resolver(
            r#"
api_gateway: true
api_limit:
  order_create:
    limit_level: ip
    rate: [60, 1]
"#,
        );
        let rule = resolver.resolve("POST", "/gw/v2/shop/order.create");
        assert_eq!(rule.api_name, "order_create");
        assert_eq!(rule.level, LimitLevel::Ip);
        assert_eq!((rule.window_seconds, rule.max_attempts), (60, 1));
    }

    #[test]
    fn test_without_gateway_path_is_api_name() {
        let resolver = resolver("{}");
        assert_eq!(resolver.api_name("/gateway/v1/center/a.b"), "/gateway/v1/center/a.b");
    }
}
