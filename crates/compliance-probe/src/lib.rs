//! Compliance Probe - run one consent retrieval against a simulated page.
//!
//! The probe builds a page for the configured scenario, gates a few units of
//! dependent work behind consent, waits for resolution, and reports what the
//! service decided.

pub mod config;
pub mod scenario;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use compliance_core::{ComplianceError, Outcome};

pub use config::{CliOverrides, ProbeConfig, ScenarioKind};
pub use scenario::SimulatedPage;

/// Gated calls registered before waiting
pub const GATED_CALLS: usize = 3;

/// Result of one probe run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub applies: bool,
    pub consent_string: String,
    pub outcome: Option<Outcome>,
    pub elapsed_ms: u64,
    pub gated_calls_run: usize,
}

/// Run the configured scenario to resolution.
pub async fn run_probe(config: &ProbeConfig) -> Result<ProbeReport, ComplianceError> {
    let start = Instant::now();
    let page = SimulatedPage::build(config)?;

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let dependent_work = page.service.delay(move |slot: usize| {
        info!(slot, "Running dependent work");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    for slot in 0..GATED_CALLS {
        dependent_work.call(slot);
    }

    page.service.wait().await;

    let consent = page.service.gdpr().get_consent();
    Ok(ProbeReport {
        applies: consent.applies,
        consent_string: consent.consent_string,
        outcome: page.service.outcome(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        gated_calls_run: ran.load(Ordering::SeqCst),
    })
}
