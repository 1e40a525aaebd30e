//! Compliance Core - consent retrieval for ad-tag hosts.
//!
//! This crate implements:
//! - The compliance retrieval state machine (CMP discovery, timeout, single resolution)
//! - The CMP result decoder
//! - The delay gate that holds dependent calls until consent resolves
//! - Injected collaborators: timers, single-resolution future, command buffer, ids

#![forbid(unsafe_code)]

// Core state machine
pub mod compliance;

// Consent result handling
pub mod decoder;
pub mod providers;

// Infrastructure
pub mod command_queue;
pub mod deferred;
pub mod timer;

// Supporting modules
pub mod config;
pub mod errors;
pub mod types;
pub mod harness;

pub use compliance::{ComplianceService, ComplianceServiceBuilder, Delayed, Gdpr};
pub use config::ComplianceConfig;
pub use errors::{ComplianceError, ConfigError};
pub use types::{GdprConsent, Outcome, ProbeSource, RetrievalStatus};
