//! Configuration for the compliance service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::errors::ConfigError;

/// Static configuration fixed at construction.
///
/// Keys follow the ad-tag config naming (`gdprAppliesDefault`, `timeout`).
/// Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComplianceConfig {
    /// Applies flag used until a CMP says otherwise
    pub gdpr_applies_default: bool,
    /// Timeout budget in milliseconds; 0 resolves without waiting
    pub timeout: u64,
    /// Legacy provider source text; accepted by the parser only so it can
    /// be rejected with a precise error
    #[serde(default, skip_serializing)]
    custom_fn: Option<Value>,
}

impl ComplianceConfig {
    pub fn new(gdpr_applies_default: bool, timeout_ms: u64) -> Self {
        Self {
            gdpr_applies_default,
            timeout: timeout_ms,
            custom_fn: None,
        }
    }

    /// Parse and validate a JSON configuration value.
    pub fn from_json_value(value: Value) -> Result<Self, ConfigError> {
        let config: ComplianceConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: ComplianceConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ComplianceConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to read compliance config");
            ConfigError::Parse(e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.custom_fn.is_some() {
            return Err(ConfigError::ExecutableSource);
        }
        // ~49 days
        if self.timeout > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "timeout must be at most {} ms, got {}",
                u32::MAX,
                self.timeout
            )));
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self::new(false, 0)
    }
}
