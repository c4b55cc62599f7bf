//! Configuration surface: the frozen, validated value type constructed once
//! at startup and threaded by reference through the rest of the pipeline.
//!
//! Configuration is loaded from a YAML file. Before parsing, `${VAR}` and
//! `${VAR:-default}` references in the raw text are expanded against the
//! process environment, mirroring the variable-interpolation step most
//! sidecar daemons apply ahead of struct deserialization.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetSyncConfig {
    pub provider: ProviderConfig,
    pub haproxy: HaProxyConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Selects the active `DiscoveryClient` backend. Exactly one provider is
/// active per process instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ProviderConfig {
    Azure {
        subscription_id: String,
        resource_group: String,
        #[serde(default)]
        vmss_names: Vec<String>,
    },
    Aws {
        region: String,
        #[serde(default)]
        asg_names: Vec<String>,
    },
}

impl ProviderConfig {
    pub fn default_name_prefix(&self) -> &'static str {
        match self {
            ProviderConfig::Azure { .. } => "azure",
            ProviderConfig::Aws { .. } => "aws",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HaProxyConfig {
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Enables AZ weighting logic (§4.5) when present.
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub server_slots: ServerSlotsConfig,
    /// service-name -> free-form create-backend JSON fragment, merged
    /// verbatim when the backend is first created.
    #[serde(default)]
    pub backend_options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Defaults to the active provider's name when absent.
    pub name_prefix: Option<String>,
    #[serde(default = "default_name_separator")]
    pub name_separator: String,
    #[serde(default = "default_balance")]
    pub balance: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name_prefix: None,
            name_separator: default_name_separator(),
            balance: default_balance(),
            mode: default_mode(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GrowthType {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSlotsConfig {
    #[serde(default = "default_slot_base")]
    pub base: u32,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_growth_type")]
    pub growth_type: GrowthType,
}

impl Default for ServerSlotsConfig {
    fn default() -> Self {
        Self {
            base: default_slot_base(),
            growth_factor: default_growth_factor(),
            growth_type: default_growth_type(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TagsConfig {
    #[serde(default = "default_service_name_tag")]
    pub service_name_tag: String,
    #[serde(default = "default_service_port_tag")]
    pub service_port_tag: String,
    #[serde(default = "default_instance_port_tag")]
    pub instance_port_tag: String,
    #[serde(default = "default_az_weight_tag")]
    pub az_weight_tag: String,
    #[serde(default)]
    pub allowlist: BTreeMap<String, String>,
    #[serde(default)]
    pub denylist: BTreeMap<String, String>,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            service_name_tag: default_service_name_tag(),
            service_port_tag: default_service_port_tag(),
            instance_port_tag: default_instance_port_tag(),
            az_weight_tag: default_az_weight_tag(),
            allowlist: BTreeMap::new(),
            denylist: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_jitter_seconds")]
    pub jitter_seconds: u64,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            jitter_seconds: default_jitter_seconds(),
            backoff_base_seconds: default_backoff_base_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_api_version() -> String {
    "v2".to_string()
}
fn default_timeout_seconds() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_name_separator() -> String {
    "-".to_string()
}
fn default_balance() -> String {
    "roundrobin".to_string()
}
fn default_mode() -> String {
    "http".to_string()
}
fn default_slot_base() -> u32 {
    10
}
fn default_growth_factor() -> f64 {
    1.5
}
fn default_growth_type() -> GrowthType {
    GrowthType::Linear
}
fn default_service_name_tag() -> String {
    "HAProxy:Service:Name".to_string()
}
fn default_service_port_tag() -> String {
    "HAProxy:Service:Port".to_string()
}
fn default_instance_port_tag() -> String {
    "HAProxy:Instance:Port".to_string()
}
fn default_az_weight_tag() -> String {
    "HAProxy:Instance:AZperc".to_string()
}
fn default_interval_seconds() -> u64 {
    30
}
fn default_jitter_seconds() -> u64 {
    5
}
fn default_backoff_base_seconds() -> u64 {
    5
}
fn default_max_backoff_seconds() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration from `path`, expanding `${VAR}` / `${VAR:-default}`
/// references against the process environment before parsing, then
/// validating the result.
pub fn load(path: &Path) -> Result<FleetSyncConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let interpolated = interpolate_env(&raw);
    let config: FleetSyncConfig = serde_yaml::from_str(&interpolated)?;
    validate(&config)?;
    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment. Unknown variables with no default expand to an empty
/// string, matching common shell-like interpolation semantics.
pub fn interpolate_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("valid regex");
    pattern
        .replace_all(raw, |caps: &regex::Captures| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => value,
                Err(_) => caps.get(3).map(|m| m.as_str()).unwrap_or("").to_string(),
            }
        })
        .into_owned()
}

/// Reject invalid configuration before any network I/O occurs. This is
/// also the entire behavior of `--validate`.
pub fn validate(config: &FleetSyncConfig) -> Result<(), ConfigError> {
    if config.polling.interval_seconds < 1 {
        return Err(ConfigError::invalid(
            "polling.interval_seconds",
            "must be at least 1",
        ));
    }
    if config.haproxy.server_slots.base < 1 {
        return Err(ConfigError::invalid(
            "haproxy.server_slots.base",
            "must be at least 1",
        ));
    }
    if config.haproxy.server_slots.growth_factor <= 1.0 {
        return Err(ConfigError::invalid(
            "haproxy.server_slots.growth_factor",
            "must be greater than 1.0",
        ));
    }
    if reqwest::Url::parse(&config.haproxy.base_url).is_err() {
        return Err(ConfigError::invalid(
            "haproxy.base_url",
            "must be a valid URL",
        ));
    }
    match &config.provider {
        ProviderConfig::Azure {
            subscription_id,
            resource_group,
            ..
        } => {
            if subscription_id.is_empty() {
                return Err(ConfigError::missing("provider.subscription_id"));
            }
            if resource_group.is_empty() {
                return Err(ConfigError::missing("provider.resource_group"));
            }
        }
        ProviderConfig::Aws { region, .. } => {
            if region.is_empty() {
                return Err(ConfigError::missing("provider.region"));
            }
        }
    }
    Ok(())
}

impl FleetSyncConfig {
    /// The prefix used in `backend_name`, defaulting to the active
    /// provider's name when `haproxy.backend.name_prefix` is unset.
    pub fn backend_name_prefix(&self) -> String {
        self.haproxy
            .backend
            .name_prefix
            .clone()
            .unwrap_or_else(|| self.provider.default_name_prefix().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_plain_var() {
        std::env::set_var("FLEET_SYNC_TEST_VAR", "hello");
        assert_eq!(interpolate_env("value: ${FLEET_SYNC_TEST_VAR}"), "value: hello");
        std::env::remove_var("FLEET_SYNC_TEST_VAR");
    }

    #[test]
    fn interpolates_default_when_unset() {
        std::env::remove_var("FLEET_SYNC_MISSING_VAR");
        assert_eq!(
            interpolate_env("value: ${FLEET_SYNC_MISSING_VAR:-fallback}"),
            "value: fallback"
        );
    }

    #[test]
    fn rejects_bad_growth_factor() {
        let config = FleetSyncConfig {
            provider: ProviderConfig::Aws {
                region: "us-east-1".into(),
                asg_names: vec![],
            },
            haproxy: HaProxyConfig {
                base_url: "https://example.com".into(),
                api_version: default_api_version(),
                username: "u".into(),
                password: "p".into(),
                timeout_seconds: default_timeout_seconds(),
                verify_ssl: true,
                availability_zone: None,
                backend: BackendConfig::default(),
                server_slots: ServerSlotsConfig {
                    base: 10,
                    growth_factor: 1.0,
                    growth_type: GrowthType::Linear,
                },
                backend_options: BTreeMap::new(),
            },
            tags: TagsConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(validate(&config).is_err());
    }
}
