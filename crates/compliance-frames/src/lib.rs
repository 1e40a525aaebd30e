//! Cross-frame transport for the CMP consent handshake.
//!
//! This crate provides the frame contracts the compliance service needs to
//! reach a CMP hosted in an ancestor frame, without depending on any browser
//! binding:
//! - [`traits`]: frame contexts, ancestor lookup, and the inbound message bus
//! - [`wire`]: the `__cmpCall` / `__cmpReturn` envelopes
//! - [`testing`]: in-memory frames and bus for tests and simulations

pub mod traits;
pub mod wire;
pub mod testing;

pub use traits::*;
pub use wire::*;
pub use testing::*;
