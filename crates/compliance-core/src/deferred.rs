//! Single-resolution future.
//!
//! A [`Deferred`] honors only its first `resolve()`. Continuations registered
//! with [`Deferred::then`] run synchronously in the resolving call, in
//! registration order; continuations registered afterwards run immediately.
//! Async callers wait on [`Deferred::wait`].

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

type Continuation = Box<dyn FnOnce() + Send>;

struct DeferredState {
    resolved: bool,
    continuations: Vec<Continuation>,
}

pub struct Deferred {
    state: Mutex<DeferredState>,
    signal: watch::Sender<bool>,
}

impl Deferred {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            state: Mutex::new(DeferredState {
                resolved: false,
                continuations: Vec::new(),
            }),
            signal,
        }
    }

    /// Resolve. Returns true only for the call that actually resolved.
    pub fn resolve(&self) -> bool {
        let continuations = {
            let mut state = self.state.lock();
            if state.resolved {
                return false;
            }
            state.resolved = true;
            std::mem::take(&mut state.continuations)
        };

        for continuation in continuations {
            continuation();
        }
        self.signal.send_replace(true);
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().resolved
    }

    /// Chain `f` after resolution. May be called any number of times.
    pub fn then(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            if !state.resolved {
                state.continuations.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Future completing once resolved. Also completes if the deferred is
    /// dropped unresolved, so waiters never hang on a discarded session.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.signal.subscribe();
        async move {
            let _ = rx.wait_for(|resolved| *resolved).await;
        }
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}
