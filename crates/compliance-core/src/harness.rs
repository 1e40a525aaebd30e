//! Test harness for compliance retrieval.
//!
//! [`ManualTimers`] is a virtual clock implementing [`TimerService`] so the
//! state machine can be driven deterministically. [`ScriptedCmp`] stands in
//! for either kind of CMP function.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    compliance::ComplianceService,
    errors::ProviderError,
    providers::{ConsentCallback, CustomCmp, InPageCmp},
    timer::{IntervalId, TimerCallback, TimerId, TimerService},
    types::GdprConsent,
};

// ============================================================================
// Virtual clock
// ============================================================================

struct ManualTimer {
    duration: Duration,
    deadline: Option<Duration>,
    on_fire: TimerCallback,
}

struct ManualInterval {
    period: Duration,
    next_due: Duration,
    tick: TimerCallback,
}

struct ClockState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<TimerId, ManualTimer>,
    intervals: BTreeMap<IntervalId, ManualInterval>,
}

enum Due {
    Timer(TimerCallback),
    Interval(TimerCallback),
}

/// Timer service driven by [`ManualTimers::advance`].
///
/// Callbacks run on the caller of `advance`, outside the clock lock. When a
/// timer and an interval fall due at the same instant the interval runs first.
pub struct ManualTimers {
    state: Mutex<ClockState>,
    created: AtomicUsize,
    fired: AtomicUsize,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                now: Duration::ZERO,
                next_id: 1,
                timers: BTreeMap::new(),
                intervals: BTreeMap::new(),
            }),
            created: AtomicUsize::new(0),
            fired: AtomicUsize::new(0),
        }
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move the clock forward, running everything that falls due on the way.
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        loop {
            let Some(due) = self.next_due(target) else {
                break;
            };
            match due {
                Due::Timer(on_fire) => {
                    self.fired.fetch_add(1, Ordering::SeqCst);
                    on_fire();
                }
                Due::Interval(tick) => tick(),
            }
        }
        let mut state = self.state.lock();
        if state.now < target {
            state.now = target;
        }
    }

    fn next_due(&self, target: Duration) -> Option<Due> {
        let mut state = self.state.lock();

        let timer = state
            .timers
            .iter()
            .filter_map(|(id, t)| t.deadline.map(|at| (at, *id)))
            .min();
        let interval = state
            .intervals
            .iter()
            .map(|(id, i)| (i.next_due, *id))
            .min();

        let interval_first = match (timer, interval) {
            (_, Some((at, _))) if at > target => false,
            (Some((t, _)), Some((i, _))) => i <= t,
            (None, Some(_)) => true,
            (_, None) => false,
        };

        if interval_first {
            let (at, id) = interval?;
            let entry = state.intervals.get_mut(&id)?;
            entry.next_due = at + entry.period;
            let tick = entry.tick.clone();
            state.now = at;
            return Some(Due::Interval(tick));
        }

        let (at, id) = timer.filter(|(at, _)| *at <= target)?;
        let entry = state.timers.get_mut(&id)?;
        entry.deadline = None;
        let on_fire = entry.on_fire.clone();
        state.now = at;
        Some(Due::Timer(on_fire))
    }

    /// Timers ever created
    pub fn created_timers(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Timer callbacks run so far
    pub fn fired_timers(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    /// Timers not yet cancelled, idle or running
    pub fn active_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn running_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .values()
            .filter(|t| t.deadline.is_some())
            .count()
    }

    pub fn active_intervals(&self) -> usize {
        self.state.lock().intervals.len()
    }
}

impl Default for ManualTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for ManualTimers {
    fn create_timer(&self, duration: Duration, auto_start: bool, on_fire: TimerCallback) -> TimerId {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let deadline = auto_start.then(|| state.now + duration);
        state.timers.insert(
            id,
            ManualTimer {
                duration,
                deadline,
                on_fire,
            },
        );
        id
    }

    fn start_timer(&self, id: TimerId) {
        let mut state = self.state.lock();
        let now = state.now;
        if let Some(timer) = state.timers.get_mut(&id) {
            if timer.deadline.is_none() {
                timer.deadline = Some(now + timer.duration);
            }
        }
    }

    fn cancel_timer(&self, id: TimerId) {
        let removed = self.state.lock().timers.remove(&id);
        drop(removed);
    }

    fn set_interval(&self, period: Duration, tick: TimerCallback) -> IntervalId {
        let mut state = self.state.lock();
        let id = IntervalId(state.next_id);
        state.next_id += 1;
        let next_due = state.now + period;
        state.intervals.insert(
            id,
            ManualInterval {
                period,
                next_due,
                tick,
            },
        );
        id
    }

    fn clear_interval(&self, id: IntervalId) {
        let removed = self.state.lock().intervals.remove(&id);
        drop(removed);
    }
}

// ============================================================================
// Scripted CMP
// ============================================================================

enum Script {
    Never,
    Respond(Value),
    /// Answer from inside the nth call (1-based)
    RespondOnCall(usize, Value),
    Fail,
}

/// CMP function with a fixed behavior.
///
/// Keeps the most recent callback so a test can answer asynchronously
/// through [`ScriptedCmp::deliver`].
pub struct ScriptedCmp {
    script: Script,
    calls: AtomicUsize,
    commands: Mutex<Vec<String>>,
    last_callback: Mutex<Option<ConsentCallback>>,
}

impl ScriptedCmp {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            last_callback: Mutex::new(None),
        }
    }

    /// Never answers on its own
    pub fn never() -> Self {
        Self::with_script(Script::Never)
    }

    /// Answers synchronously on every call
    pub fn responding(payload: Value) -> Self {
        Self::with_script(Script::Respond(payload))
    }

    pub fn responding_on_call(call: usize, payload: Value) -> Self {
        Self::with_script(Script::RespondOnCall(call, payload))
    }

    /// Fails every call
    pub fn failing() -> Self {
        Self::with_script(Script::Fail)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commands received through the in-page calling convention
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Answer through the most recent callback. Returns false if never called.
    pub fn deliver(&self, payload: Value) -> bool {
        let callback = self.last_callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    fn invoke(&self, callback: ConsentCallback) -> Result<(), ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_callback.lock() = Some(callback.clone());

        match &self.script {
            Script::Never => Ok(()),
            Script::Respond(payload) => {
                callback(payload.clone());
                Ok(())
            }
            Script::RespondOnCall(n, payload) => {
                if call == *n {
                    callback(payload.clone());
                }
                Ok(())
            }
            Script::Fail => Err(ProviderError::CallFailed("scripted failure".to_string())),
        }
    }
}

impl InPageCmp for ScriptedCmp {
    fn call(
        &self,
        command: &str,
        _parameter: Option<&Value>,
        callback: ConsentCallback,
    ) -> Result<(), ProviderError> {
        self.commands.lock().push(command.to_string());
        self.invoke(callback)
    }
}

impl CustomCmp for ScriptedCmp {
    fn call(&self, callback: ConsentCallback) -> Result<(), ProviderError> {
        self.invoke(callback)
    }
}

/// Wait for `service` to resolve and return the consent it settled on.
pub async fn resolve_consent(service: &ComplianceService) -> GdprConsent {
    service.wait().await;
    service.gdpr().get_consent()
}
