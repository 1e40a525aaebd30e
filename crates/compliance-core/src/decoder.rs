//! CMP result decoding.
//!
//! CMPs answer `getConsentData` with either a bare consent string or an
//! object whose field names vary between CMP generations. Raw payloads are
//! first tagged as [`CmpResult`], then reduced to a [`ConsentRecord`] that
//! only carries the fields that were present with the expected type.

use serde_json::{Map, Value};

/// Field names carrying the applies flag, in priority order
pub const APPLIES_FIELDS: [&str; 2] = ["gdprApplies", "isUserInEu"];

/// Field name carrying the consent string
pub const CONSENT_FIELD: &str = "consentData";

/// A CMP payload of an accepted shape
#[derive(Clone, Debug, PartialEq)]
pub enum CmpResult {
    /// Bare consent string
    String(String),
    /// Structured result
    Object(Map<String, Value>),
}

impl CmpResult {
    /// Tag a raw payload. Anything other than a string or an object
    /// (null, booleans, numbers, arrays) is not a result.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(CmpResult::String(s)),
            Value::Object(map) => Some(CmpResult::Object(map)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CmpResult::String(_) => "string",
            CmpResult::Object(_) => "object",
        }
    }

    pub fn decode(self) -> ConsentRecord {
        match self {
            CmpResult::String(s) => ConsentRecord {
                applies: None,
                consent_string: Some(s),
            },
            CmpResult::Object(map) => decode_object(&map),
        }
    }
}

/// Partial consent record; `None` leaves the session value untouched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsentRecord {
    pub applies: Option<bool>,
    pub consent_string: Option<String>,
}

impl ConsentRecord {
    pub fn is_empty(&self) -> bool {
        self.applies.is_none() && self.consent_string.is_none()
    }
}

/// Decode an object result. Mistyped fields are skipped one by one.
pub fn decode_object(map: &Map<String, Value>) -> ConsentRecord {
    let applies = APPLIES_FIELDS
        .iter()
        .find_map(|name| map.get(*name).and_then(Value::as_bool));

    let consent_string = map
        .get(CONSENT_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned);

    ConsentRecord {
        applies,
        consent_string,
    }
}
