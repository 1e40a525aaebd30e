//! Error types for Compliance Core.
//!
//! Only construction can fail from a caller's point of view. Provider and
//! transport failures are recovered inside the state machine and surface as
//! log lines, never as errors returned from `wait()`.

use thiserror::Error;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors raised while loading or validating a [`ComplianceConfig`].
///
/// [`ComplianceConfig`]: crate::config::ComplianceConfig
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Input could not be parsed into the config shape
    #[error("config parse error: {0}")]
    Parse(String),

    /// Parsed values violate a constraint
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The legacy `customFn` key carried provider source text
    #[error("invalid configuration: customFn source text is not accepted; register a custom CMP provider instead")]
    ExecutableSource,
}

// ============================================================================
// Construction Errors
// ============================================================================

/// Errors returned when building a compliance service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    /// Configuration rejected
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// No runtime available for the default timer service
    #[error("runtime error: {0}")]
    Runtime(String),
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Errors returned by CMP provider invocations.
///
/// These never abort discovery; the state machine logs them and keeps
/// waiting on the remaining strategies and the timeout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider raised an error while handling the call
    #[error("CMP call failed: {0}")]
    CallFailed(String),
}
