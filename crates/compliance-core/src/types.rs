use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Retrieval progress. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    NotStarted,
    InProgress,
    Complete,
}

/// Discovery strategy that produced a result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSource {
    /// In-page CMP function
    InPage,
    /// Operator-registered CMP function
    Custom,
    /// CMP in an ancestor frame
    Frame,
}

impl fmt::Display for ProbeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeSource::InPage => write!(f, "in-page"),
            ProbeSource::Custom => write!(f, "custom"),
            ProbeSource::Frame => write!(f, "frame"),
        }
    }
}

/// Why a retrieval resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum Outcome {
    /// A CMP result was accepted
    ProviderResult(ProbeSource),
    /// The timeout fired before any accepted result
    Timeout,
    /// No CMP could be found
    NoProvider,
    /// A CMP was engaged but the budget was zero
    ZeroTimeout,
}

/// Consent snapshot handed to dependent code
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GdprConsent {
    pub applies: bool,
    pub consent_string: String,
}

/// Largest integer that survives a round trip through a JS number
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Source of correlation ids for cross-frame requests.
pub trait IdGenerator: Send + Sync {
    /// An id unique within the page session.
    fn generate_unique_id(&self) -> u64;
}

/// Monotonic ids starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn generate_unique_id(&self) -> u64 {
        // Replies echo the id through JS numbers
        self.next.fetch_add(1, Ordering::Relaxed) % (MAX_SAFE_INTEGER + 1)
    }
}
