//! In-memory frames for testing and simulation.

use crate::traits::{
    FrameContext, FrameMessage, FrameTree, ListenerId, MessageBus, MessageListener, TransportError,
};
use crate::wire::{decode_call, CmpReturnEnvelope};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Message bus for the current frame
pub struct LocalBus {
    listeners: Mutex<BTreeMap<ListenerId, MessageListener>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
        }
    }

    /// Deliver a message to every listener registered at the time of the call.
    ///
    /// Listeners run without the registry lock held, so they may add or
    /// remove listeners themselves.
    pub fn deliver(&self, message: &FrameMessage) -> usize {
        let snapshot: Vec<MessageListener> = self.listeners.lock().values().cloned().collect();
        self.delivered.fetch_add(1, Ordering::Relaxed);
        for listener in &snapshot {
            listener(message);
        }
        snapshot.len()
    }

    /// Number of currently registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Number of messages delivered so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LocalBus {
    fn add_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }
}

/// How a [`MockFrame`] answers `__cmpCall` requests
#[derive(Clone)]
struct Responder {
    reply_to: Arc<LocalBus>,
    return_value: Value,
    delay: Duration,
    serialized: bool,
    call_id_override: Option<u64>,
}

/// Mock frame that records posted messages and can host a CMP
pub struct MockFrame {
    name: String,
    cmp_locator: bool,
    posted: Mutex<Vec<FrameMessage>>,
    detached: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl MockFrame {
    /// A frame without the CMP locator marker
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmp_locator: false,
            posted: Mutex::new(Vec::new()),
            detached: AtomicBool::new(false),
            responder: Mutex::new(None),
        }
    }

    /// A frame exposing the CMP locator marker that never answers
    pub fn with_locator(name: impl Into<String>) -> Self {
        Self {
            cmp_locator: true,
            ..Self::plain(name)
        }
    }

    /// Answer every decodable request by delivering a reply to `reply_to`.
    ///
    /// A zero delay delivers the reply synchronously from `post_message`;
    /// otherwise the reply is delivered from a spawned tokio task.
    pub fn answer_with(
        self,
        reply_to: Arc<LocalBus>,
        return_value: Value,
        delay: Duration,
    ) -> Self {
        *self.responder.lock() = Some(Responder {
            reply_to,
            return_value,
            delay,
            serialized: false,
            call_id_override: None,
        });
        self
    }

    /// Send replies as serialized JSON text instead of structured values.
    pub fn reply_serialized(self) -> Self {
        if let Some(responder) = self.responder.lock().as_mut() {
            responder.serialized = true;
        }
        self
    }

    /// Echo this id instead of the request's id.
    pub fn reply_with_call_id(self, call_id: u64) -> Self {
        if let Some(responder) = self.responder.lock().as_mut() {
            responder.call_id_override = Some(call_id);
        }
        self
    }

    /// Messages posted to this frame
    pub fn posted(&self) -> Vec<FrameMessage> {
        self.posted.lock().clone()
    }

    /// Simulate the frame going away
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Relaxed);
    }

    fn respond(&self, message: &FrameMessage) {
        let Some(responder) = self.responder.lock().clone() else {
            return;
        };
        let call = match decode_call(message) {
            Ok(Some(call)) => call,
            Ok(None) => return,
            Err(e) => {
                warn!(frame = %self.name, error = %e, "Mock frame could not decode request");
                return;
            }
        };

        let call_id = responder.call_id_override.unwrap_or(call.call_id);
        let reply = match CmpReturnEnvelope::new(call_id, responder.return_value.clone(), true)
            .to_message(responder.serialized)
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(frame = %self.name, error = %e, "Mock frame could not encode reply");
                return;
            }
        };

        debug!(frame = %self.name, call_id, "Mock frame answering CMP request");
        if responder.delay.is_zero() {
            responder.reply_to.deliver(&reply);
        } else {
            let bus = responder.reply_to.clone();
            let delay = responder.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                bus.deliver(&reply);
            });
        }
    }
}

impl FrameContext for MockFrame {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_cmp_locator(&self) -> bool {
        self.cmp_locator
    }

    fn post_message(&self, message: FrameMessage, _target_origin: &str) -> Result<(), TransportError> {
        if self.detached.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        self.posted.lock().push(message.clone());
        self.respond(&message);
        Ok(())
    }
}

/// Ancestor chain of the current frame, nearest first
pub struct FrameChain {
    ancestors: Vec<Arc<dyn FrameContext>>,
}

impl FrameChain {
    pub fn new(ancestors: Vec<Arc<dyn FrameContext>>) -> Self {
        Self { ancestors }
    }

    /// A top-level window with no ancestors
    pub fn top_level() -> Self {
        Self::new(Vec::new())
    }
}

impl FrameTree for FrameChain {
    fn find_ancestor(
        &self,
        predicate: &dyn Fn(&dyn FrameContext) -> bool,
    ) -> Option<Arc<dyn FrameContext>> {
        self.ancestors
            .iter()
            .find(|frame| predicate(frame.as_ref()))
            .cloned()
    }
}
