//! Arbiter tunables, loadable from JSON or YAML.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::notify::NotificationMode;

/// Tunables for rate limiting, audit retention and surface presentation.
#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    pub auth_rate_interval: Duration,
    pub sign_rate_interval: Duration,
    pub rate_limit_entries: usize,
    pub audit_capacity: usize,
    pub notification: NotificationMode,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            auth_rate_interval: Duration::from_secs(5),
            sign_rate_interval: Duration::from_secs(3),
            rate_limit_entries: 10,
            audit_capacity: security_log::DEFAULT_CAPACITY,
            notification: NotificationMode::Popup,
        }
    }
}

/// Errors surfaced while parsing arbiter configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to deserialize config: {0}")]
    Deserialize(String),
    #[error("invalid interval '{0}': {1}")]
    InvalidInterval(String, String),
    #[error("unknown notification mode: {0}")]
    UnknownMode(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    auth_rate_interval: Option<String>,
    sign_rate_interval: Option<String>,
    rate_limit_entries: Option<usize>,
    audit_capacity: Option<usize>,
    notification: Option<NotificationMode>,
}

/// Parse a config document, trying JSON first and falling back to YAML.
/// Intervals are humantime strings ("5s", "500ms"); absent fields keep
/// their defaults.
pub fn parse_config_str(raw: &str) -> Result<ArbiterConfig, ConfigError> {
    let raw_cfg: RawConfig = match serde_json::from_str(raw) {
        Ok(cfg) => cfg,
        Err(json_err) => serde_yaml::from_str(raw).map_err(|yaml_err| {
            ConfigError::Deserialize(format!(
                "json error: {json_err}; yaml error: {yaml_err}"
            ))
        })?,
    };

    let mut config = ArbiterConfig::default();
    if let Some(value) = raw_cfg.auth_rate_interval {
        config.auth_rate_interval = parse_interval(&value)?;
    }
    if let Some(value) = raw_cfg.sign_rate_interval {
        config.sign_rate_interval = parse_interval(&value)?;
    }
    if let Some(value) = raw_cfg.rate_limit_entries {
        config.rate_limit_entries = value;
    }
    if let Some(value) = raw_cfg.audit_capacity {
        config.audit_capacity = value;
    }
    if let Some(value) = raw_cfg.notification {
        config.notification = value;
    }
    Ok(config)
}

fn parse_interval(raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw)
        .map_err(|err| ConfigError::InvalidInterval(raw.to_string(), err.to_string()))
}
