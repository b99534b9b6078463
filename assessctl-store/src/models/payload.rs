//! Opaque, caller-versioned payloads (`request_data`, `result_data`, audit `context`).
//!
//! The store checks that a payload is well-formed JSON and otherwise never
//! looks inside it. The schema of `data` belongs to whoever wrote it, and the
//! `version` field lets that owner evolve it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::ValidationError;

/// Versioned raw-JSON container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Caller-defined schema version of `data`
    pub version: u16,
    data: Box<RawValue>,
}

impl Payload {
    /// Serialize a caller value into a payload.
    pub fn encode<T: Serialize>(version: u16, value: &T) -> Result<Self, ValidationError> {
        let data = serde_json::value::to_raw_value(value).map_err(|e| {
            ValidationError::MalformedPayload {
                field: "payload",
                reason: e.to_string(),
            }
        })?;
        Ok(Self { version, data })
    }

    /// Wrap pre-serialized JSON text, rejecting anything that is not well-formed.
    pub fn from_json_str(version: u16, json: &str) -> Result<Self, ValidationError> {
        let data = RawValue::from_string(json.to_owned()).map_err(|e| {
            ValidationError::MalformedPayload {
                field: "payload",
                reason: e.to_string(),
            }
        })?;
        Ok(Self { version, data })
    }

    /// Decode `data` into the caller's own type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.data.get())
    }

    /// Raw JSON text of `data`. JSONB storage may normalise key order and whitespace.
    pub fn raw(&self) -> &str {
        self.data.get()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.data.get() == other.data.get()
    }
}
