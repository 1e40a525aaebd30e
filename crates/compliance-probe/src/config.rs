//! Probe configuration: a TOML file with `[compliance]` and `[scenario]`
//! tables, overridable from the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use compliance_core::{ComplianceConfig, ConfigError as CoreConfigError};

/// Environment variable naming the config file when `--config` is absent
pub const CONFIG_ENV: &str = "COMPLIANCE_PROBE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
    #[error(transparent)]
    Compliance(#[from] CoreConfigError),
}

/// Which CMP the simulated page carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// No CMP anywhere
    #[default]
    None,
    /// CMP function on the hosting page
    InPage,
    /// Operator-registered CMP function
    Custom,
    /// CMP in an ancestor frame
    Frame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub kind: ScenarioKind,
    /// How long the simulated CMP takes to answer
    pub respond_after_ms: u64,
    /// Raw CMP answer
    pub payload: Value,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            kind: ScenarioKind::None,
            respond_after_ms: 50,
            payload: json!({ "gdprApplies": true, "consentData": "BOprobe" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub compliance: ComplianceConfig,
    pub scenario: ScenarioConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            compliance: ComplianceConfig::new(false, 1000),
            scenario: ScenarioConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub scenario: Option<ScenarioKind>,
    pub respond_after_ms: Option<u64>,
    pub payload: Option<String>,
    pub timeout_ms: Option<u64>,
    pub applies_default: Option<bool>,
}

impl ProbeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ProbeConfig =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to read probe config");
            ConfigError::FileNotFound(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path`, else from [`CONFIG_ENV`], else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match path {
            Some(path) => {
                info!(path = %path.display(), "Loading probe config");
                Self::load_from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Result<Self, ConfigError> {
        if let Some(kind) = overrides.scenario {
            self.scenario.kind = kind;
        }
        if let Some(ms) = overrides.respond_after_ms {
            self.scenario.respond_after_ms = ms;
        }
        if let Some(payload) = &overrides.payload {
            self.scenario.payload = serde_json::from_str(payload)
                .map_err(|e| ConfigError::ParseError(format!("--payload: {e}")))?;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.compliance.timeout = ms;
        }
        if let Some(applies) = overrides.applies_default {
            self.compliance.gdpr_applies_default = applies;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compliance.validate()?;
        if self.scenario.respond_after_ms > u64::from(u32::MAX) {
            return Err(ConfigError::ValidationError(format!(
                "respondAfterMs must be at most {} ms",
                u32::MAX
            )));
        }
        Ok(())
    }
}
