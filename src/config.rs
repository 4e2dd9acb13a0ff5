//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! upstream API paths, retry and cooldown bounds, queue capacities, logging
//! format, and default paths. `AppConfig` is the root configuration struct
//! containing all settings.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;

// =============================================================================
// Upstream API Paths
// =============================================================================
// Relative paths on the retail site's API. These are upstream-owned; the
// request/response shapes that go with them live in `upstream::client`.

/// Identity endpoint that sends an OTP to a phone number
pub const API_GENERATE_OTP: &str = "api/auth/generateLoginOTP";

/// Identity endpoint that exchanges phone + OTP for session cookies
pub const API_LOGIN: &str = "api/auth/login";

/// Category listing endpoint; category code is appended as a path segment
pub const API_CATEGORY: &str = "api/category";

/// Product detail endpoint; product id is appended as a path segment
pub const API_PRODUCT: &str = "api/product";

/// Cart mutation endpoints used by the availability simulation
pub const API_CART_ADD: &str = "api/cart/add";
pub const API_CART_REMOVE: &str = "api/cart/remove";

/// Delivery estimate endpoint (serviceability per postal code)
pub const API_DELIVERY_CHECK: &str = "api/edd/checkDeliveryDetails";

// =============================================================================
// Upstream Request Shaping
// =============================================================================

/// Browser identity presented to the upstream. The site serves its API only to
/// clients that look like its own web frontend.
const CHROME_MAJOR: u32 = 137;
pub const UPSTREAM_USER_AGENT: &str = formatcp!(
    "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Mobile Safari/537.36",
    CHROME_MAJOR
);

/// Page size requested from the category listing endpoint
pub const DISCOVERY_PAGE_SIZE: u32 = 60;

/// Cookies the upstream expects from every client, authenticated or not
pub const BASE_COOKIES: &[(&str, &str)] = &[
    ("V", "1"),
    ("LS", "LOGGED_IN"),
    ("customerType", "Existing"),
];

// =============================================================================
// Retry and Backoff Constants
// =============================================================================

/// Base delay for the jittered exponential backoff between retry attempts
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Cap on the backoff delay regardless of attempt count
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;

// =============================================================================
// Proxy Pool Constants
// =============================================================================

/// Consecutive failures after which an endpoint enters cooldown
pub const PROXY_FAILURE_THRESHOLD: u32 = 3;

/// Base cooldown applied when the failure threshold is first crossed
pub const PROXY_COOLDOWN_BASE_SECS: u64 = 30;

/// Cap on the exponential cooldown window
pub const PROXY_COOLDOWN_CAP_SECS: u64 = 900;

// =============================================================================
// Session Constants
// =============================================================================

/// How long a pending OTP login stays completable before it must be restarted
pub const OTP_PENDING_TTL_SECS: i64 = 600;

// =============================================================================
// Notification Queue Constants
// =============================================================================

/// Capacity of the notification hand-off queue. A full queue fails the
/// dispatch, leaving the record pending for resend.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "pinwatch=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Retail upstream settings
    pub upstream: UpstreamConfig,
    /// Outbound proxy pool
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Periodic check scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Per-user document storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Which users may hold state and be checked
    pub access: AccessConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the retail site's API
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the retail site, e.g. "https://shop.example.in"
    pub base_url: String,
    /// Value for the x-tenant-id header, if the upstream requires one
    #[serde(default)]
    pub tenant: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "UpstreamConfig::default_timeout")]
    pub timeout_seconds: u64,
    /// Retry attempts per logical operation
    #[serde(default = "UpstreamConfig::default_retry_attempts")]
    pub retry_attempts: u32,
    /// Cap on products taken from one discovery call
    #[serde(default = "UpstreamConfig::default_max_products")]
    pub max_products: usize,
    /// Politeness delay bounds between successive product-level operations
    #[serde(default = "UpstreamConfig::default_wait_min_ms")]
    pub wait_min_ms: u64,
    #[serde(default = "UpstreamConfig::default_wait_max_ms")]
    pub wait_max_ms: u64,
    /// TTL for cached discovery results in seconds
    #[serde(default = "UpstreamConfig::default_discovery_cache_ttl")]
    pub discovery_cache_ttl_seconds: u64,
}

impl UpstreamConfig {
    fn default_timeout() -> u64 {
        20
    }
    fn default_retry_attempts() -> u32 {
        3
    }
    fn default_max_products() -> usize {
        90
    }
    fn default_wait_min_ms() -> u64 {
        1_500
    }
    fn default_wait_max_ms() -> u64 {
        3_000
    }
    fn default_discovery_cache_ttl() -> u64 {
        600
    }
}

/// Outbound proxy pool configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    /// Whether the pool is used at all; disabled means direct connections
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint addresses as "host:port"
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Shared credentials for all endpoints
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Region-pinned endpoint preferred for cart/delivery calls
    #[serde(default)]
    pub checkout: Option<String>,
    /// Fall back to a direct connection when every endpoint is cooling down
    #[serde(default)]
    pub allow_direct: bool,
}

/// Periodic check scheduling
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Minutes between scheduled fleet-wide checks
    #[serde(default = "SchedulerConfig::default_interval_minutes")]
    pub interval_minutes: u64,
    /// Delay before the first scheduled check after startup
    #[serde(default = "SchedulerConfig::default_first_delay_seconds")]
    pub first_delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: Self::default_interval_minutes(),
            first_delay_seconds: Self::default_first_delay_seconds(),
        }
    }
}

impl SchedulerConfig {
    fn default_interval_minutes() -> u64 {
        5
    }
    fn default_first_delay_seconds() -> u64 {
        30
    }
}

/// Per-user document storage
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON document per user
    #[serde(default = "StorageConfig::default_data_dir")]
    pub data_dir: String,
    /// Days a seen product stays suppressed before re-evaluation
    #[serde(default = "StorageConfig::default_retention_days")]
    pub retention_days: i64,
    /// Size bound on the seen-products ledger; oldest entries pruned first
    #[serde(default = "StorageConfig::default_max_seen_entries")]
    pub max_seen_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            retention_days: Self::default_retention_days(),
            max_seen_entries: Self::default_max_seen_entries(),
        }
    }
}

impl StorageConfig {
    fn default_data_dir() -> String {
        "./data".to_string()
    }
    fn default_retention_days() -> i64 {
        7
    }
    fn default_max_seen_entries() -> usize {
        500
    }
}

/// Authorized users
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Opaque user identifiers allowed to hold state and be checked
    pub authorized_users: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.upstream.base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "upstream.base_url must be an https:// URL".to_string(),
            ));
        }
        if self.upstream.wait_min_ms > self.upstream.wait_max_ms {
            return Err(ConfigError::Validation(
                "upstream.wait_min_ms must not exceed upstream.wait_max_ms".to_string(),
            ));
        }
        if self.upstream.retry_attempts == 0 {
            return Err(ConfigError::Validation(
                "upstream.retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.proxy.enabled && self.proxy.endpoints.is_empty() && self.proxy.checkout.is_none() {
            return Err(ConfigError::Validation(
                "proxy.enabled is set but no endpoints are configured".to_string(),
            ));
        }
        if self.access.authorized_users.is_empty() {
            return Err(ConfigError::Validation(
                "access.authorized_users must list at least one user".to_string(),
            ));
        }
        Ok(())
    }

    /// Host part of the upstream base URL, for validating monitor URLs
    pub fn upstream_host(&self) -> &str {
        let rest = self
            .upstream
            .base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        rest.split('/').next().unwrap_or(rest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [upstream]
            base_url = "https://shop.example.in"

            [access]
            authorized_users = ["100", "200"]
        "#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.upstream.max_products, 90);
        assert_eq!(config.upstream.retry_attempts, 3);
        assert_eq!(config.scheduler.interval_minutes, 5);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.storage.max_seen_entries, 500);
        assert!(!config.proxy.enabled);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_rejects_plain_http_base_url() {
        let toml_str = minimal_toml().replace("https://", "http://");
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_enabled_pool_without_endpoints() {
        let toml_str = format!("{}\n[proxy]\nenabled = true\n", minimal_toml());
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_inverted_wait_bounds() {
        let toml_str = minimal_toml().replace(
            "base_url = \"https://shop.example.in\"",
            "base_url = \"https://shop.example.in\"\nwait_min_ms = 5000\nwait_max_ms = 100",
        );
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_empty_authorized_users() {
        let toml_str = minimal_toml().replace("[\"100\", \"200\"]", "[]");
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_upstream_host_strips_scheme_and_path() {
        let toml_str = minimal_toml().replace(
            "https://shop.example.in",
            "https://shop.example.in/landing",
        );
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.upstream_host(), "shop.example.in");
    }
}
