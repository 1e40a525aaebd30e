//! Frame traits for ancestor discovery and cross-frame messaging.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A message crossing a frame boundary.
///
/// Receivers in the wild accept either a JSON string or a structured clone,
/// so both shapes are carried explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameMessage {
    /// JSON text, as produced by `JSON.stringify` on the sending side
    Serialized(String),
    /// Structured value delivered as-is
    Structured(Value),
}

impl FrameMessage {
    /// Returns true if this is the serialized-text form.
    pub fn is_serialized(&self) -> bool {
        matches!(self, FrameMessage::Serialized(_))
    }
}

/// Identifier for a registered message listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Callback invoked for every inbound message on a bus
pub type MessageListener = Arc<dyn Fn(&FrameMessage) + Send + Sync>;

/// A window or frame context that can receive posted messages.
pub trait FrameContext: Send + Sync {
    /// Human-readable frame name, used in logs.
    fn name(&self) -> &str;

    /// Whether this frame exposes the CMP locator marker.
    fn has_cmp_locator(&self) -> bool;

    /// Post a message to this frame.
    fn post_message(&self, message: FrameMessage, target_origin: &str) -> Result<(), TransportError>;
}

/// Ancestor-frame locator.
pub trait FrameTree: Send + Sync {
    /// Walk the ancestors of the current frame, nearest first, and return the
    /// first one satisfying `predicate`.
    fn find_ancestor(
        &self,
        predicate: &dyn Fn(&dyn FrameContext) -> bool,
    ) -> Option<Arc<dyn FrameContext>>;
}

/// Inbound message delivery for the current frame.
pub trait MessageBus: Send + Sync {
    /// Register a listener; it receives every message until removed.
    fn add_listener(&self, listener: MessageListener) -> ListenerId;

    /// Remove a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Common transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("frame detached")]
    Disconnected,
}
