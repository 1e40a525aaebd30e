//! Timer service.
//!
//! One-shot timers are created idle or running and fire their callback once
//! per start. `start_timer` on a timer that is already counting leaves the
//! running countdown alone, so a deadline is measured from the first start.
//! Intervals tick every period until cleared; the first tick is one period
//! after creation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

use crate::errors::ComplianceError;

/// Callback run by a timer or interval
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval#{}", self.0)
    }
}

/// Timer primitive used by the compliance state machine.
pub trait TimerService: Send + Sync {
    /// Create a one-shot timer. Unless `auto_start`, it stays idle until
    /// [`TimerService::start_timer`].
    fn create_timer(&self, duration: Duration, auto_start: bool, on_fire: TimerCallback) -> TimerId;

    /// Ensure the timer is counting. No-op while a countdown is running.
    fn start_timer(&self, id: TimerId);

    /// Stop and forget the timer.
    fn cancel_timer(&self, id: TimerId);

    /// Run `tick` every `period` until cleared.
    fn set_interval(&self, period: Duration, tick: TimerCallback) -> IntervalId;

    fn clear_interval(&self, id: IntervalId);
}

// ============================================================================
// Tokio-backed Timer Service
// ============================================================================

struct TokioTimer {
    duration: Duration,
    on_fire: TimerCallback,
    /// Running countdown, if any
    task: Option<JoinHandle<()>>,
}

/// Timer service running countdowns as tasks on a tokio runtime.
pub struct TokioTimerService {
    handle: Handle,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, TokioTimer>>>,
    intervals: Mutex<HashMap<IntervalId, JoinHandle<()>>>,
}

impl TokioTimerService {
    /// Bind to an explicit runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
            intervals: Mutex::new(HashMap::new()),
        }
    }

    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self, ComplianceError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ComplianceError::Runtime(e.to_string()))
    }

    /// Number of timers that exist (idle or running)
    pub fn timer_count(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.lock().len()
    }

    fn spawn_countdown(&self, id: TimerId, duration: Duration) -> JoinHandle<()> {
        let timers = self.timers.clone();
        self.handle.spawn(async move {
            time::sleep(duration).await;
            let on_fire = {
                let mut timers = timers.lock();
                match timers.get_mut(&id) {
                    Some(timer) => {
                        timer.task = None;
                        timer.on_fire.clone()
                    }
                    None => return,
                }
            };
            debug!(timer = %id, "Timer fired");
            on_fire();
        })
    }
}

impl TimerService for TokioTimerService {
    fn create_timer(&self, duration: Duration, auto_start: bool, on_fire: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.timers.lock().insert(
            id,
            TokioTimer {
                duration,
                on_fire,
                task: None,
            },
        );
        if auto_start {
            self.start_timer(id);
        }
        id
    }

    fn start_timer(&self, id: TimerId) {
        let mut timers = self.timers.lock();
        let Some(timer) = timers.get_mut(&id) else {
            return;
        };
        if timer.task.is_some() {
            return;
        }
        timer.task = Some(self.spawn_countdown(id, timer.duration));
    }

    fn cancel_timer(&self, id: TimerId) {
        // Dropped outside the lock; the callback may own the last session handle.
        let removed = self.timers.lock().remove(&id);
        if let Some(timer) = removed {
            if let Some(task) = timer.task {
                task.abort();
            }
        }
    }

    fn set_interval(&self, period: Duration, tick: TimerCallback) -> IntervalId {
        let id = IntervalId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = self.handle.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        });
        self.intervals.lock().insert(id, task);
        id
    }

    fn clear_interval(&self, id: IntervalId) {
        let removed = self.intervals.lock().remove(&id);
        if let Some(task) = removed {
            task.abort();
        }
    }
}

impl Drop for TokioTimerService {
    fn drop(&mut self) {
        for (_, timer) in self.timers.lock().drain() {
            if let Some(task) = timer.task {
                task.abort();
            }
        }
        for (_, task) in self.intervals.lock().drain() {
            task.abort();
        }
    }
}
