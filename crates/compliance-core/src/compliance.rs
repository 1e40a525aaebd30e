//! Compliance retrieval state machine.
//!
//! A [`ComplianceService`] discovers a CMP once, races its strategies
//! against a timeout, and resolves exactly once:
//! - In-page and custom CMP functions are called immediately and then polled
//!   every 250 ms while a timeout budget exists
//! - Without either, the nearest ancestor frame exposing the CMP locator is
//!   asked over the `__cmpCall` / `__cmpReturn` handshake
//! - With no CMP at all, the session resolves at once with defaults
//!
//! The first accepted result or the timer wins. Resolution cancels the timer,
//! clears the poll, removes the message listener, and releases every call
//! gated through [`ComplianceService::delay`] in the order it was made.
//!
//! Callbacks registered with the timer service and the message bus hold the
//! session, so a started session outlives its handles until it resolves.
//! Teardown drops those callbacks.
//!
//! The state lock is never held while calling out to a provider, a
//! collaborator, or a gated command, so callbacks may re-enter freely.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use compliance_frames::{
    decode_return, CmpCallEnvelope, FrameContext, FrameMessage, FrameTree, ListenerId, MessageBus,
    WireError, ANY_ORIGIN, GET_CONSENT_DATA,
};

use crate::{
    command_queue::CommandQueue,
    config::ComplianceConfig,
    decoder::CmpResult,
    deferred::Deferred,
    errors::ComplianceError,
    providers::{ConsentCallback, CustomCmp, InPageCmp},
    timer::{IntervalId, TimerCallback, TimerId, TimerService, TokioTimerService},
    types::{GdprConsent, IdGenerator, Outcome, ProbeSource, RetrievalStatus, SequentialIds},
};

/// Poll cadence for in-page and custom CMPs
pub const CMP_CHECK_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Session State
// ============================================================================

struct SessionState {
    status: RetrievalStatus,
    gdpr_applies: bool,
    consent_string: String,
    has_latched: bool,
    timer: Option<TimerId>,
    poll: Option<IntervalId>,
    listener: Option<ListenerId>,
    /// Correlation id of the last cross-frame request
    call_id: Option<u64>,
    outcome: Option<Outcome>,
}

/// Frame collaborators for the cross-frame strategy
#[derive(Clone)]
pub struct FrameAccess {
    pub tree: Arc<dyn FrameTree>,
    pub bus: Arc<dyn MessageBus>,
}

struct Inner {
    state: Mutex<SessionState>,
    retrieval: Deferred,
    commands: CommandQueue,
    timers: Arc<dyn TimerService>,
    ids: Arc<dyn IdGenerator>,
    in_page: Option<Arc<dyn InPageCmp>>,
    custom: Option<Arc<dyn CustomCmp>>,
    frames: Option<FrameAccess>,
    timeout: Duration,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ComplianceService`]. Everything the session talks to is
/// injected here.
pub struct ComplianceServiceBuilder {
    config: ComplianceConfig,
    timers: Option<Arc<dyn TimerService>>,
    ids: Option<Arc<dyn IdGenerator>>,
    in_page: Option<Arc<dyn InPageCmp>>,
    custom: Option<Arc<dyn CustomCmp>>,
    frames: Option<FrameAccess>,
}

impl ComplianceServiceBuilder {
    /// Timer service; defaults to a [`TokioTimerService`] on the current runtime.
    pub fn timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Correlation id source; defaults to [`SequentialIds`].
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// The CMP function exposed by the hosting page.
    pub fn in_page_cmp(mut self, cmp: Arc<dyn InPageCmp>) -> Self {
        self.in_page = Some(cmp);
        self
    }

    /// An operator-supplied CMP function.
    pub fn custom_cmp(mut self, cmp: Arc<dyn CustomCmp>) -> Self {
        self.custom = Some(cmp);
        self
    }

    /// Frame ancestry and inbound message bus of the hosting frame.
    pub fn frames(mut self, tree: Arc<dyn FrameTree>, bus: Arc<dyn MessageBus>) -> Self {
        self.frames = Some(FrameAccess { tree, bus });
        self
    }

    /// Validate the configuration, create the session, and start discovery.
    pub fn build(self) -> Result<ComplianceService, ComplianceError> {
        self.config.validate()?;

        let timers: Arc<dyn TimerService> = match self.timers {
            Some(timers) => timers,
            None => Arc::new(TokioTimerService::current()?),
        };
        let ids = self.ids.unwrap_or_else(|| Arc::new(SequentialIds::new()));

        let inner = Arc::new(Inner {
            state: Mutex::new(SessionState {
                status: RetrievalStatus::NotStarted,
                gdpr_applies: self.config.gdpr_applies_default,
                consent_string: String::new(),
                has_latched: false,
                timer: None,
                poll: None,
                listener: None,
                call_id: None,
                outcome: None,
            }),
            retrieval: Deferred::new(),
            commands: CommandQueue::new(),
            timers,
            ids,
            in_page: self.in_page,
            custom: self.custom,
            frames: self.frames,
            timeout: self.config.timeout_duration(),
        });

        inner.retrieve();
        Ok(ComplianceService { inner })
    }
}

// ============================================================================
// Compliance Service
// ============================================================================

/// Consent retrieval session for one page load.
#[derive(Clone)]
pub struct ComplianceService {
    inner: Arc<Inner>,
}

impl ComplianceService {
    pub fn builder(config: ComplianceConfig) -> ComplianceServiceBuilder {
        ComplianceServiceBuilder {
            config,
            timers: None,
            ids: None,
            in_page: None,
            custom: None,
            frames: None,
        }
    }

    /// Future completing when consent resolves.
    ///
    /// Starts discovery if needed and makes sure the timeout is counting
    /// while the session is unresolved. Every caller shares one resolution.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.retrieve();
        self.inner.start_timer_if_waiting();
        self.inner.retrieval.wait()
    }

    /// Gate `func` behind resolution.
    ///
    /// Calls made through the returned [`Delayed`] before resolution run
    /// after it, in call order; later calls run immediately.
    pub fn delay<A, F>(&self, func: F) -> Delayed<A>
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        Delayed {
            inner: self.inner.clone(),
            func: Arc::new(func),
        }
    }

    pub fn gdpr(&self) -> Gdpr<'_> {
        Gdpr { inner: &self.inner }
    }

    pub fn is_privacy_enabled(&self) -> bool {
        true
    }

    pub fn status(&self) -> RetrievalStatus {
        self.inner.state.lock().status
    }

    /// Why the session resolved, once it has
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.state.lock().outcome
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.retrieval.is_resolved()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Gated calls still waiting for resolution
    pub fn pending_commands(&self) -> usize {
        self.inner.commands.len()
    }
}

impl fmt::Debug for ComplianceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ComplianceService")
            .field("status", &state.status)
            .field("gdpr_applies", &state.gdpr_applies)
            .field("consent_string", &state.consent_string)
            .field("outcome", &state.outcome)
            .finish()
    }
}

/// GDPR view of a session
pub struct Gdpr<'a> {
    inner: &'a Inner,
}

impl Gdpr<'_> {
    /// Current consent snapshot.
    pub fn get_consent(&self) -> GdprConsent {
        let state = self.inner.state.lock();
        GdprConsent {
            applies: state.gdpr_applies,
            consent_string: state.consent_string.clone(),
        }
    }

    /// Override the applies flag, whatever the retrieval status.
    pub fn set_applies(&self, applies: bool) {
        info!(applies, "Setting GDPR applicability bit");
        self.inner.state.lock().gdpr_applies = applies;
    }
}

/// A function gated behind consent resolution
pub struct Delayed<A> {
    inner: Arc<Inner>,
    func: Arc<dyn Fn(A) + Send + Sync>,
}

impl<A> Clone for Delayed<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            func: self.func.clone(),
        }
    }
}

impl<A: Send + 'static> Delayed<A> {
    pub fn call(&self, args: A) {
        self.inner.retrieve();
        self.inner.start_timer_if_waiting();

        let func = self.func.clone();
        self.inner.commands.push(Box::new(move || func(args)));
    }
}

// ============================================================================
// Discovery
// ============================================================================

impl Inner {
    fn retrieve(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != RetrievalStatus::NotStarted {
                return;
            }
            state.status = RetrievalStatus::InProgress;
        }

        let weak = Arc::downgrade(self);
        self.retrieval.then(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_resolved();
            }
        });

        let engaged = if self.in_page.is_some() || self.custom.is_some() {
            if self.in_page.is_some() {
                info!("Found in-page CMP");
            }
            if self.custom.is_some() {
                info!("Found custom CMP");
            }
            self.call_providers();
            if !self.timeout.is_zero() {
                self.start_polling();
            }
            true
        } else {
            self.request_from_frame()
        };

        if !engaged {
            info!("No CMP found, using default consent");
            self.resolve(Outcome::NoProvider);
            return;
        }

        if self.timeout.is_zero() {
            debug!("Zero compliance timeout, not waiting for CMP");
            self.resolve(Outcome::ZeroTimeout);
            return;
        }

        self.create_timeout_timer();
    }

    fn callback(self: &Arc<Self>, source: ProbeSource) -> ConsentCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |payload: Value| {
            if let Some(inner) = weak.upgrade() {
                inner.accept(payload, source);
            }
        })
    }

    /// One round of calls to every registered CMP function.
    fn call_providers(self: &Arc<Self>) {
        if let Some(cmp) = &self.in_page {
            if let Err(e) = cmp.call(GET_CONSENT_DATA, None, self.callback(ProbeSource::InPage)) {
                error!(error = %e, "In-page CMP function error");
            }
        }
        if let Some(cmp) = &self.custom {
            if let Err(e) = cmp.call(self.callback(ProbeSource::Custom)) {
                error!(error = %e, "Custom CMP function error");
            }
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let inner = self.clone();
        let tick: TimerCallback = Arc::new(move || inner.call_providers());
        let id = self.timers.set_interval(CMP_CHECK_INTERVAL, tick);

        let mut state = self.state.lock();
        if state.status == RetrievalStatus::Complete {
            drop(state);
            self.timers.clear_interval(id);
        } else {
            state.poll = Some(id);
        }
    }

    /// Ask an ancestor CMP frame. Returns false if no such frame exists.
    fn request_from_frame(self: &Arc<Self>) -> bool {
        let Some(frames) = &self.frames else {
            return false;
        };

        debug!("Looking for CMP ancestor frame");
        let Some(frame) = frames
            .tree
            .find_ancestor(&|ctx: &dyn FrameContext| ctx.has_cmp_locator())
        else {
            return false;
        };

        let call_id = self.ids.generate_unique_id();
        self.state.lock().call_id = Some(call_id);

        let inner = self.clone();
        let listener = frames
            .bus
            .add_listener(Arc::new(move |message: &FrameMessage| inner.handle_message(message)));
        self.state.lock().listener = Some(listener);

        info!(frame = frame.name(), call_id, "Requesting consent data from CMP frame");
        match CmpCallEnvelope::get_consent_data(call_id).to_messages() {
            Ok(messages) => {
                for message in messages {
                    let serialized = message.is_serialized();
                    if let Err(e) = frame.post_message(message, ANY_ORIGIN) {
                        warn!(frame = frame.name(), serialized, error = %e, "Failed to post CMP request");
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to encode CMP request"),
        }
        true
    }

    fn create_timeout_timer(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            if state.status == RetrievalStatus::Complete || state.timer.is_some() {
                return;
            }
        }

        let inner = self.clone();
        let on_fire: TimerCallback = Arc::new(move || inner.on_timeout());
        let id = self.timers.create_timer(self.timeout, false, on_fire);

        let mut state = self.state.lock();
        if state.status == RetrievalStatus::Complete {
            drop(state);
            self.timers.cancel_timer(id);
        } else {
            state.timer = Some(id);
        }
    }

    fn start_timer_if_waiting(&self) {
        let timer = {
            let state = self.state.lock();
            if state.status == RetrievalStatus::Complete {
                None
            } else {
                state.timer
            }
        };
        if let Some(id) = timer {
            self.timers.start_timer(id);
        }
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    fn handle_message(&self, message: &FrameMessage) {
        let reply = match decode_return(message) {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            // Other scripts post plain text on the same channel.
            Err(WireError::Json(e)) => {
                debug!(error = %e, "Ignoring non-JSON inter-frame message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Error handling CMP inter-frame message");
                return;
            }
        };

        let expected = self.state.lock().call_id;
        if expected != Some(reply.call_id) {
            debug!(call_id = reply.call_id, expected = ?expected, "Ignoring CMP reply for another request");
            return;
        }

        debug!(call_id = reply.call_id, success = reply.success, "CMP frame replied");
        self.accept(reply.return_value, ProbeSource::Frame);
    }

    fn accept(&self, payload: Value, source: ProbeSource) {
        let Some(result) = CmpResult::from_value(payload) else {
            warn!(source = %source, "CMP result had unexpected type");
            return;
        };
        let kind = result.kind();

        {
            let mut state = self.state.lock();
            if state.has_latched
                || state.outcome.is_some()
                || state.status == RetrievalStatus::Complete
            {
                debug!(source = %source, "Dropping CMP result, consent already resolved");
                return;
            }
            state.has_latched = true;

            let record = result.decode();
            if let Some(applies) = record.applies {
                state.gdpr_applies = applies;
            }
            if let Some(consent_string) = record.consent_string {
                state.consent_string = consent_string;
            }
        }

        info!(source = %source, kind, "CMP callback received result");
        self.resolve(Outcome::ProviderResult(source));
    }

    fn on_timeout(&self) {
        if self.state.lock().status != RetrievalStatus::Complete {
            let timeout_ms = self.timeout.as_millis() as u64;
            info!(timeout_ms, "CMP timed out with no result, using default consent");
        }
        self.resolve(Outcome::Timeout);
    }

    fn resolve(&self, outcome: Outcome) {
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            state.status = RetrievalStatus::Complete;
        }
        self.retrieval.resolve();
    }

    /// Runs once, inside the resolving call.
    fn on_resolved(&self) {
        let (timer, poll, listener, outcome, applies) = {
            let mut state = self.state.lock();
            (
                state.timer.take(),
                state.poll.take(),
                state.listener.take(),
                state.outcome,
                state.gdpr_applies,
            )
        };

        if let Some(id) = timer {
            self.timers.cancel_timer(id);
        }
        if let Some(id) = poll {
            self.timers.clear_interval(id);
        }
        if let (Some(id), Some(frames)) = (listener, &self.frames) {
            frames.bus.remove_listener(id);
        }

        info!(outcome = ?outcome, applies, "Consent retrieval complete");
        self.commands.release();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{ManualTimers, ScriptedCmp};
    use compliance_frames::{FrameChain, LocalBus, MockFrame};
    use serde_json::json;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Rig {
        timers: Arc<ManualTimers>,
        bus: Arc<LocalBus>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                timers: Arc::new(ManualTimers::new()),
                bus: Arc::new(LocalBus::new()),
            }
        }

        fn builder(&self, applies_default: bool, timeout_ms: u64) -> ComplianceServiceBuilder {
            ComplianceService::builder(ComplianceConfig::new(applies_default, timeout_ms))
                .timers(self.timers.clone())
        }

        fn with_frames(
            &self,
            builder: ComplianceServiceBuilder,
            ancestors: Vec<Arc<dyn FrameContext>>,
        ) -> ComplianceServiceBuilder {
            builder.frames(Arc::new(FrameChain::new(ancestors)), self.bus.clone())
        }
    }

    fn consent(service: &ComplianceService) -> (bool, String) {
        let c = service.gdpr().get_consent();
        (c.applies, c.consent_string)
    }

    #[test]
    fn test_no_provider_resolves_immediately_without_timer() {
        let rig = Rig::new();
        let service = rig.with_frames(rig.builder(true, 5000), Vec::new()).build().unwrap();

        assert!(service.is_resolved());
        assert_eq!(service.status(), RetrievalStatus::Complete);
        assert_eq!(service.outcome(), Some(Outcome::NoProvider));
        assert_eq!(consent(&service), (true, String::new()));
        assert_eq!(rig.timers.created_timers(), 0);

        // wait() after the fact still never creates a timer
        let _ = service.wait();
        assert_eq!(rig.timers.created_timers(), 0);
    }

    #[test]
    fn test_frame_without_locator_is_not_a_provider() {
        let rig = Rig::new();
        let plain: Arc<dyn FrameContext> = Arc::new(MockFrame::plain("parent"));
        let service = rig.with_frames(rig.builder(false, 100), vec![plain]).build().unwrap();
        assert_eq!(service.outcome(), Some(Outcome::NoProvider));
        assert_eq!(rig.bus.listener_count(), 0);
    }

    #[test]
    fn test_zero_timeout_resolves_without_callback() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 0).in_page_cmp(cmp.clone()).build().unwrap();

        assert!(service.is_resolved());
        assert_eq!(service.outcome(), Some(Outcome::ZeroTimeout));
        assert_eq!(consent(&service), (false, String::new()));
        assert_eq!(cmp.calls(), 1);
        assert_eq!(rig.timers.created_timers(), 0);
        assert_eq!(rig.timers.active_intervals(), 0);

        // A late answer does not change the decision
        assert!(cmp.deliver(json!("LATE")));
        assert_eq!(consent(&service), (false, String::new()));
    }

    #[test]
    fn test_zero_timeout_keeps_synchronous_result() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::responding(json!({ "gdprApplies": true, "consentData": "SYNC" })));
        let service = rig.builder(false, 0).in_page_cmp(cmp).build().unwrap();

        assert_eq!(service.outcome(), Some(Outcome::ProviderResult(ProbeSource::InPage)));
        assert_eq!(consent(&service), (true, "SYNC".to_string()));
    }

    #[test]
    fn test_scenario_timeout_with_silent_provider() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(true, 100).in_page_cmp(cmp.clone()).build().unwrap();
        let _ = service.wait();

        rig.timers.advance(ms(99));
        assert!(!service.is_resolved());
        assert_eq!(service.status(), RetrievalStatus::InProgress);

        rig.timers.advance(ms(1));
        assert!(service.is_resolved());
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
        assert_eq!(consent(&service), (true, String::new()));
        assert_eq!(cmp.calls(), 1);
        assert_eq!(rig.timers.active_intervals(), 0);
    }

    #[test]
    fn test_scenario_object_result_cancels_timer() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();
        let _ = service.wait();
        assert_eq!(rig.timers.running_timers(), 1);

        rig.timers.advance(ms(10));
        assert!(cmp.deliver(json!({ "gdprApplies": true, "consentData": "XYZ" })));

        assert!(service.is_resolved());
        assert_eq!(rig.timers.now(), ms(10));
        assert_eq!(consent(&service), (true, "XYZ".to_string()));
        assert_eq!(rig.timers.active_timers(), 0);
        assert_eq!(rig.timers.active_intervals(), 0);

        rig.timers.advance(ms(6000));
        assert_eq!(rig.timers.fired_timers(), 0);
        assert_eq!(cmp.calls(), 1);
    }

    #[test]
    fn test_scenario_string_result_keeps_applies() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(true, 5000).custom_cmp(cmp.clone()).build().unwrap();
        let _ = service.wait();

        cmp.deliver(json!("ABC123"));
        assert_eq!(consent(&service), (true, "ABC123".to_string()));
        assert_eq!(service.outcome(), Some(Outcome::ProviderResult(ProbeSource::Custom)));
    }

    #[test]
    fn test_first_result_wins() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        cmp.deliver(json!({ "gdprApplies": true, "consentData": "FIRST" }));
        cmp.deliver(json!({ "gdprApplies": false, "consentData": "SECOND" }));
        cmp.deliver(json!("THIRD"));
        assert_eq!(consent(&service), (true, "FIRST".to_string()));
    }

    #[test]
    fn test_unexpected_payload_does_not_latch() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        cmp.deliver(json!(42));
        cmp.deliver(json!(null));
        assert!(!service.is_resolved());

        cmp.deliver(json!("OK"));
        assert!(service.is_resolved());
        assert_eq!(consent(&service).1, "OK");
    }

    #[test]
    fn test_object_without_known_fields_still_resolves() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(true, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        cmp.deliver(json!({ "gdprApplies": "yes", "other": 1 }));
        assert!(service.is_resolved());
        assert_eq!(consent(&service), (true, String::new()));
    }

    #[test]
    fn test_set_applies_overrides_in_any_status() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        assert_eq!(service.status(), RetrievalStatus::InProgress);
        service.gdpr().set_applies(true);
        assert!(service.gdpr().get_consent().applies);

        cmp.deliver(json!({ "gdprApplies": false }));
        assert!(!service.gdpr().get_consent().applies);

        service.gdpr().set_applies(true);
        assert_eq!(service.status(), RetrievalStatus::Complete);
        assert!(service.gdpr().get_consent().applies);
    }

    #[test]
    fn test_privacy_enabled() {
        let rig = Rig::new();
        let service = rig.builder(false, 0).build().unwrap();
        assert!(service.is_privacy_enabled());
    }

    #[test]
    fn test_in_page_receives_get_consent_data() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let _service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();
        assert_eq!(cmp.commands(), vec!["getConsentData".to_string()]);
    }

    #[test]
    fn test_both_providers_are_called() {
        let rig = Rig::new();
        let in_page = Arc::new(ScriptedCmp::never());
        let custom = Arc::new(ScriptedCmp::responding(json!({ "isUserInEu": true, "consentData": "C" })));
        let service = rig
            .builder(false, 5000)
            .in_page_cmp(in_page.clone())
            .custom_cmp(custom.clone())
            .build()
            .unwrap();

        assert_eq!(in_page.calls(), 1);
        assert_eq!(custom.calls(), 1);
        assert_eq!(service.outcome(), Some(Outcome::ProviderResult(ProbeSource::Custom)));
        assert_eq!(consent(&service), (true, "C".to_string()));
        assert_eq!(rig.timers.created_timers(), 0);
    }

    #[test]
    fn test_polls_every_250ms_until_resolved() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();
        assert_eq!(cmp.calls(), 1);

        rig.timers.advance(ms(249));
        assert_eq!(cmp.calls(), 1);
        rig.timers.advance(ms(1));
        assert_eq!(cmp.calls(), 2);
        rig.timers.advance(ms(500));
        assert_eq!(cmp.calls(), 4);

        cmp.deliver(json!("DONE"));
        assert!(service.is_resolved());
        rig.timers.advance(ms(1000));
        assert_eq!(cmp.calls(), 4);
    }

    #[test]
    fn test_provider_answering_on_poll() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::responding_on_call(3, json!({ "consentData": "POLLED" })));
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();
        let _ = service.wait();

        rig.timers.advance(ms(500));
        assert!(service.is_resolved());
        assert_eq!(consent(&service).1, "POLLED");
        assert_eq!(cmp.calls(), 3);
        assert_eq!(rig.timers.active_intervals(), 0);
    }

    #[test]
    fn test_provider_errors_are_contained() {
        let rig = Rig::new();
        let failing = Arc::new(ScriptedCmp::failing());
        let custom = Arc::new(ScriptedCmp::never());
        let service = rig
            .builder(false, 1000)
            .in_page_cmp(failing.clone())
            .custom_cmp(custom.clone())
            .build()
            .unwrap();
        let _ = service.wait();

        rig.timers.advance(ms(250));
        assert_eq!(failing.calls(), 2);
        assert_eq!(custom.calls(), 2);

        custom.deliver(json!("RECOVERED"));
        assert_eq!(service.outcome(), Some(Outcome::ProviderResult(ProbeSource::Custom)));
    }

    #[test]
    fn test_failing_provider_falls_back_to_timeout() {
        let rig = Rig::new();
        let failing = Arc::new(ScriptedCmp::failing());
        let service = rig.builder(true, 300).in_page_cmp(failing).build().unwrap();
        let _ = service.wait();

        rig.timers.advance(ms(300));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
        assert_eq!(consent(&service), (true, String::new()));
    }

    #[test]
    fn test_late_result_after_timeout_is_dropped() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 100).in_page_cmp(cmp.clone()).build().unwrap();
        let _ = service.wait();

        rig.timers.advance(ms(100));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));

        cmp.deliver(json!({ "gdprApplies": true, "consentData": "LATE" }));
        assert_eq!(consent(&service), (false, String::new()));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
    }

    #[test]
    fn test_timer_is_idle_until_waited_on() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 100).in_page_cmp(cmp).build().unwrap();

        assert_eq!(rig.timers.created_timers(), 1);
        assert_eq!(rig.timers.running_timers(), 0);
        rig.timers.advance(ms(1000));
        assert!(!service.is_resolved());

        let _ = service.wait();
        rig.timers.advance(ms(100));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
    }

    #[test]
    fn test_single_timer_with_hard_deadline() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 100).in_page_cmp(cmp).build().unwrap();
        let gated = service.delay(|_: ()| {});

        let _ = service.wait();
        rig.timers.advance(ms(60));
        let _ = service.wait();
        gated.call(());
        gated.call(());
        let _ = service.wait();

        assert_eq!(rig.timers.created_timers(), 1);
        rig.timers.advance(ms(40));
        assert!(service.is_resolved());
        assert_eq!(rig.timers.fired_timers(), 1);

        let _ = service.wait();
        gated.call(());
        rig.timers.advance(ms(500));
        assert_eq!(rig.timers.created_timers(), 1);
        assert_eq!(rig.timers.fired_timers(), 1);
    }

    #[test]
    fn test_delay_preserves_order() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let gated = service.delay(move |n: u32| sink.lock().push(n));

        gated.call(1);
        gated.call(2);
        gated.call(3);
        assert!(log.lock().is_empty());
        assert_eq!(service.pending_commands(), 3);

        cmp.deliver(json!("READY"));
        assert_eq!(*log.lock(), vec![1, 2, 3]);

        gated.call(4);
        assert_eq!(*log.lock(), vec![1, 2, 3, 4]);
        assert_eq!(service.pending_commands(), 0);
    }

    #[test]
    fn test_delay_starts_idle_timer() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 200).in_page_cmp(cmp).build().unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        service.delay(move |_: ()| *flag.lock() = true).call(());
        assert_eq!(rig.timers.running_timers(), 1);

        rig.timers.advance(ms(200));
        assert!(*ran.lock());
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
    }

    #[test]
    fn test_gated_calls_see_resolved_consent() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let reader = service.clone();
        service
            .delay(move |_: ()| *sink.lock() = Some(reader.gdpr().get_consent()))
            .call(());

        cmp.deliver(json!({ "gdprApplies": true, "consentData": "SEEN" }));
        let seen = seen.lock().clone().unwrap();
        assert_eq!(seen.consent_string, "SEEN");
        assert!(seen.applies);
    }

    // ------------------------------------------------------------------------
    // Cross-frame handshake
    // ------------------------------------------------------------------------

    #[test]
    fn test_frame_handshake_sends_both_formats() {
        let rig = Rig::new();
        let frame = Arc::new(MockFrame::with_locator("cmp-frame"));
        let service = rig
            .with_frames(rig.builder(false, 5000), vec![frame.clone() as Arc<dyn FrameContext>])
            .ids(Arc::new(SequentialIds::starting_at(77)))
            .build()
            .unwrap();

        let posted = frame.posted();
        assert_eq!(posted.len(), 2);
        assert!(posted[0].is_serialized());
        assert_eq!(
            posted[1],
            FrameMessage::Structured(json!({
                "__cmpCall": { "command": "getConsentData", "parameter": null, "callId": 77 }
            }))
        );
        assert_eq!(rig.bus.listener_count(), 1);
        assert!(!service.is_resolved());
    }

    #[test]
    fn test_frame_reply_resolves_and_removes_listener() {
        let rig = Rig::new();
        let frame: Arc<dyn FrameContext> = Arc::new(
            MockFrame::with_locator("cmp-frame").answer_with(
                rig.bus.clone(),
                json!({ "gdprApplies": true, "consentData": "FRAME" }),
                Duration::ZERO,
            ),
        );
        let service = rig
            .with_frames(rig.builder(false, 5000), vec![frame])
            .build()
            .unwrap();

        assert_eq!(service.outcome(), Some(Outcome::ProviderResult(ProbeSource::Frame)));
        assert_eq!(consent(&service), (true, "FRAME".to_string()));
        assert_eq!(rig.bus.listener_count(), 0);
        assert_eq!(rig.timers.created_timers(), 0);
    }

    #[test]
    fn test_frame_serialized_reply() {
        let rig = Rig::new();
        let frame: Arc<dyn FrameContext> = Arc::new(
            MockFrame::with_locator("cmp-frame")
                .answer_with(rig.bus.clone(), json!("SERIAL"), Duration::ZERO)
                .reply_serialized(),
        );
        let service = rig
            .with_frames(rig.builder(true, 5000), vec![frame])
            .build()
            .unwrap();
        assert_eq!(consent(&service), (true, "SERIAL".to_string()));
    }

    #[test]
    fn test_frame_reply_with_wrong_call_id_is_ignored() {
        let rig = Rig::new();
        let frame: Arc<dyn FrameContext> = Arc::new(
            MockFrame::with_locator("cmp-frame")
                .answer_with(rig.bus.clone(), json!("WRONG"), Duration::ZERO)
                .reply_with_call_id(999),
        );
        let service = rig
            .with_frames(rig.builder(false, 100), vec![frame])
            .ids(Arc::new(SequentialIds::starting_at(5)))
            .build()
            .unwrap();
        let _ = service.wait();

        assert!(!service.is_resolved());
        assert_eq!(rig.bus.listener_count(), 1);

        rig.timers.advance(ms(100));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
        assert_eq!(consent(&service), (false, String::new()));
        assert_eq!(rig.bus.listener_count(), 0);
    }

    #[test]
    fn test_foreign_and_malformed_messages_are_dropped() {
        let rig = Rig::new();
        let frame = Arc::new(MockFrame::with_locator("cmp-frame"));
        let service = rig
            .with_frames(rig.builder(false, 5000), vec![frame as Arc<dyn FrameContext>])
            .ids(Arc::new(SequentialIds::starting_at(1)))
            .build()
            .unwrap();

        rig.bus.deliver(&FrameMessage::Serialized("not json".into()));
        rig.bus.deliver(&FrameMessage::Structured(json!({ "type": "resize" })));
        rig.bus.deliver(&FrameMessage::Structured(json!({ "__cmpReturn": { "callId": "1" } })));
        assert!(!service.is_resolved());

        rig.bus.deliver(&FrameMessage::Structured(json!({
            "__cmpReturn": { "callId": 1, "returnValue": "MATCHED", "success": true }
        })));
        assert_eq!(consent(&service).1, "MATCHED");

        // Listener is gone; nothing else is observed
        rig.bus.deliver(&FrameMessage::Structured(json!({
            "__cmpReturn": { "callId": 1, "returnValue": "AGAIN", "success": true }
        })));
        assert_eq!(consent(&service).1, "MATCHED");
    }

    #[test]
    fn test_detached_frame_still_waits_for_timeout() {
        let rig = Rig::new();
        let frame = Arc::new(MockFrame::with_locator("cmp-frame"));
        frame.detach();
        let service = rig
            .with_frames(rig.builder(true, 100), vec![frame as Arc<dyn FrameContext>])
            .build()
            .unwrap();
        let _ = service.wait();

        assert!(!service.is_resolved());
        rig.timers.advance(ms(100));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
    }

    #[test]
    fn test_functions_take_precedence_over_frames() {
        let rig = Rig::new();
        let frame = Arc::new(MockFrame::with_locator("cmp-frame"));
        let cmp = Arc::new(ScriptedCmp::never());
        let _service = rig
            .with_frames(rig.builder(false, 5000).in_page_cmp(cmp), vec![frame.clone() as Arc<dyn FrameContext>])
            .build()
            .unwrap();

        assert!(frame.posted().is_empty());
        assert_eq!(rig.bus.listener_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    #[test]
    fn test_default_timers_need_a_runtime() {
        let result = ComplianceService::builder(ComplianceConfig::new(false, 100)).build();
        assert!(matches!(result, Err(ComplianceError::Runtime(_))));
    }

    #[test]
    fn test_gated_call_runs_after_handles_are_dropped() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 100).in_page_cmp(cmp.clone()).build().unwrap();

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let _waiting = service.wait();
        service.delay(move |_: ()| *flag.lock() = true).call(());
        drop(service);

        rig.timers.advance(ms(99));
        assert!(!*ran.lock());

        rig.timers.advance(ms(1));
        assert!(*ran.lock());
        assert_eq!(rig.timers.fired_timers(), 1);
        assert_eq!(rig.timers.active_timers(), 0);
        assert_eq!(rig.timers.active_intervals(), 0);

        // Teardown released the session itself
        assert_eq!(Arc::strong_count(&cmp), 1);
    }

    #[test]
    fn test_result_after_outcome_recorded_is_dropped() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        // Outcome recorded by another thread, teardown not yet run
        service.inner.state.lock().outcome = Some(Outcome::Timeout);

        cmp.deliver(json!({ "gdprApplies": true, "consentData": "RACED" }));
        assert_eq!(consent(&service), (false, String::new()));
        assert_eq!(service.outcome(), Some(Outcome::Timeout));
    }

    #[test]
    fn test_status_completes_with_outcome() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(true, 250).in_page_cmp(cmp.clone()).build().unwrap();
        assert_eq!(service.timeout(), ms(250));

        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        let reader = service.clone();
        service
            .delay(move |_: ()| *sink.lock() = Some((reader.status(), reader.outcome())))
            .call(());

        cmp.deliver(json!("DONE"));
        assert_eq!(
            *observed.lock(),
            Some((
                RetrievalStatus::Complete,
                Some(Outcome::ProviderResult(ProbeSource::InPage))
            ))
        );
    }

    #[tokio::test]
    async fn test_wait_future_completes_on_resolution() {
        let rig = Rig::new();
        let cmp = Arc::new(ScriptedCmp::never());
        let service = rig.builder(false, 5000).in_page_cmp(cmp.clone()).build().unwrap();

        let waiting = service.wait();
        let also_waiting = service.wait();
        cmp.deliver(json!("ASYNC"));
        waiting.await;
        also_waiting.await;
        assert_eq!(consent(&service).1, "ASYNC");
    }
}
