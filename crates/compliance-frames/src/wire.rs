//! Wire envelopes for the cross-frame consent handshake.
//!
//! Outbound: `{ "__cmpCall": { "command", "parameter", "callId" } }`
//! Inbound:  `{ "__cmpReturn": { "callId", "returnValue", "success" } }`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::traits::FrameMessage;

/// Envelope key for requests sent to the CMP frame
pub const CALL_KEY: &str = "__cmpCall";

/// Envelope key for replies sent back by the CMP frame
pub const RETURN_KEY: &str = "__cmpReturn";

/// The only command issued by the compliance service
pub const GET_CONSENT_DATA: &str = "getConsentData";

/// Target origin used for posted messages
pub const ANY_ORIGIN: &str = "*";

/// Wire error
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed {0} envelope: {1}")]
    Malformed(&'static str, String),
}

/// Body of a `__cmpCall` request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmpCall {
    pub command: String,
    #[serde(default)]
    pub parameter: Value,
    #[serde(rename = "callId")]
    pub call_id: u64,
}

/// Outbound request envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmpCallEnvelope {
    #[serde(rename = "__cmpCall")]
    pub call: CmpCall,
}

impl CmpCallEnvelope {
    /// Build a `getConsentData` request for the given correlation id.
    pub fn get_consent_data(call_id: u64) -> Self {
        Self {
            call: CmpCall {
                command: GET_CONSENT_DATA.to_string(),
                parameter: Value::Null,
                call_id,
            },
        }
    }

    /// Both copies of the request, serialized first, structured second.
    pub fn to_messages(&self) -> Result<[FrameMessage; 2], WireError> {
        let structured = serde_json::to_value(self)?;
        let serialized = serde_json::to_string(&structured)?;
        Ok([
            FrameMessage::Serialized(serialized),
            FrameMessage::Structured(structured),
        ])
    }
}

/// Body of a `__cmpReturn` reply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmpReturn {
    #[serde(rename = "callId")]
    pub call_id: u64,
    #[serde(rename = "returnValue", default)]
    pub return_value: Value,
    #[serde(default)]
    pub success: bool,
}

/// Inbound reply envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmpReturnEnvelope {
    #[serde(rename = "__cmpReturn")]
    pub reply: CmpReturn,
}

impl CmpReturnEnvelope {
    pub fn new(call_id: u64, return_value: Value, success: bool) -> Self {
        Self {
            reply: CmpReturn {
                call_id,
                return_value,
                success,
            },
        }
    }

    /// Encode as a message in the requested shape.
    pub fn to_message(&self, serialized: bool) -> Result<FrameMessage, WireError> {
        let value = serde_json::to_value(self)?;
        if serialized {
            Ok(FrameMessage::Serialized(serde_json::to_string(&value)?))
        } else {
            Ok(FrameMessage::Structured(value))
        }
    }
}

/// Parse serialized text, borrowing structured messages as-is.
fn with_value<T>(
    message: &FrameMessage,
    f: impl FnOnce(&Value) -> Result<Option<T>, WireError>,
) -> Result<Option<T>, WireError> {
    match message {
        FrameMessage::Serialized(text) => {
            let value: Value = serde_json::from_str(text)?;
            f(&value)
        }
        FrameMessage::Structured(value) => f(value),
    }
}

/// Extract a `__cmpReturn` reply.
///
/// Returns `Ok(None)` when the message does not carry the reply envelope (or
/// the envelope is not an object); such messages belong to someone else.
pub fn decode_return(message: &FrameMessage) -> Result<Option<CmpReturn>, WireError> {
    with_value(message, |value| {
        let Some(body) = value.get(RETURN_KEY).filter(|b| b.is_object()) else {
            return Ok(None);
        };
        CmpReturn::deserialize(body)
            .map(Some)
            .map_err(|e| WireError::Malformed(RETURN_KEY, e.to_string()))
    })
}

/// Extract a `__cmpCall` request, used by frames that host a CMP.
pub fn decode_call(message: &FrameMessage) -> Result<Option<CmpCall>, WireError> {
    with_value(message, |value| {
        let Some(body) = value.get(CALL_KEY).filter(|b| b.is_object()) else {
            return Ok(None);
        };
        CmpCall::deserialize(body)
            .map(Some)
            .map_err(|e| WireError::Malformed(CALL_KEY, e.to_string()))
    })
}
