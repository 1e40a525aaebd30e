//! Simulated page hosting the consent retrieval.
//!
//! Each scenario wires a different CMP into the service builder. Simulated
//! CMPs answer from a spawned task after the configured delay, so the probe
//! must run inside a tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use compliance_core::{
    errors::ProviderError,
    providers::{ConsentCallback, CustomCmp, InPageCmp},
    ComplianceError, ComplianceService,
};
use compliance_frames::{FrameChain, FrameContext, LocalBus, MockFrame};

use crate::config::{ProbeConfig, ScenarioKind};

/// Page state kept alive for the duration of a probe run
pub struct SimulatedPage {
    pub bus: Arc<LocalBus>,
    /// The CMP frame, for the frame scenario
    pub cmp_frame: Option<Arc<MockFrame>>,
    pub service: ComplianceService,
}

fn answer_later(callback: ConsentCallback, payload: Value, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        callback(payload);
    });
}

fn in_page_cmp(payload: Value, delay: Duration) -> Arc<dyn InPageCmp> {
    Arc::new(
        move |command: &str, _parameter: Option<&Value>, callback: ConsentCallback| -> Result<(), ProviderError> {
            debug!(command, "Simulated in-page CMP called");
            answer_later(callback, payload.clone(), delay);
            Ok(())
        },
    )
}

fn custom_cmp(payload: Value, delay: Duration) -> Arc<dyn CustomCmp> {
    Arc::new(move |callback: ConsentCallback| -> Result<(), ProviderError> {
        debug!("Simulated custom CMP called");
        answer_later(callback, payload.clone(), delay);
        Ok(())
    })
}

impl SimulatedPage {
    /// Build the page and start consent retrieval.
    pub fn build(config: &ProbeConfig) -> Result<Self, ComplianceError> {
        let bus = Arc::new(LocalBus::new());
        let payload = config.scenario.payload.clone();
        let delay = Duration::from_millis(config.scenario.respond_after_ms);
        let builder = ComplianceService::builder(config.compliance.clone());

        let (builder, cmp_frame) = match config.scenario.kind {
            ScenarioKind::None => (
                builder.frames(Arc::new(FrameChain::top_level()), bus.clone()),
                None,
            ),
            ScenarioKind::InPage => (builder.in_page_cmp(in_page_cmp(payload, delay)), None),
            ScenarioKind::Custom => (builder.custom_cmp(custom_cmp(payload, delay)), None),
            ScenarioKind::Frame => {
                let cmp_frame =
                    Arc::new(MockFrame::with_locator("cmp-host").answer_with(bus.clone(), payload, delay));
                let ad_frame: Arc<dyn FrameContext> = Arc::new(MockFrame::plain("ad-slot"));
                let chain = FrameChain::new(vec![ad_frame, cmp_frame.clone() as Arc<dyn FrameContext>]);
                (builder.frames(Arc::new(chain), bus.clone()), Some(cmp_frame))
            }
        };

        let service = builder.build()?;
        Ok(Self {
            bus,
            cmp_frame,
            service,
        })
    }
}
