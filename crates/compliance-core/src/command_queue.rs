//! Command buffer for gated calls.
//!
//! Before release, pushed commands are only stored. `release()` runs them in
//! push order; after that, each push runs its command immediately. Commands
//! pushed by a command that is itself being drained go to the back of the
//! queue, so FIFO order holds across re-entrant pushes.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

/// A deferred call
pub type Command = Box<dyn FnOnce() + Send>;

enum QueueState {
    Buffering(VecDeque<Command>),
    Draining(VecDeque<Command>),
    Released,
}

pub struct CommandQueue {
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::Buffering(VecDeque::new())),
        }
    }

    pub fn push(&self, command: Command) {
        {
            let mut state = self.state.lock();
            match &mut *state {
                QueueState::Buffering(queue) | QueueState::Draining(queue) => {
                    queue.push_back(command);
                    return;
                }
                QueueState::Released => {}
            }
        }
        command();
    }

    /// Drain buffered commands in push order. Later calls are no-ops.
    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            let buffered = match std::mem::replace(&mut *state, QueueState::Released) {
                QueueState::Buffering(queue) => queue,
                other => {
                    *state = other;
                    return;
                }
            };
            debug!(pending = buffered.len(), "Releasing command queue");
            *state = QueueState::Draining(buffered);
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                let QueueState::Draining(queue) = &mut *state else {
                    return;
                };
                match queue.pop_front() {
                    Some(command) => command,
                    None => {
                        *state = QueueState::Released;
                        return;
                    }
                }
            };
            next();
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(*self.state.lock(), QueueState::Released)
    }

    /// Number of commands waiting to run
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            QueueState::Buffering(queue) | QueueState::Draining(queue) => queue.len(),
            QueueState::Released => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
