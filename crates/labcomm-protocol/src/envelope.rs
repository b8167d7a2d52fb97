//! The message envelope exchanged in both directions on the channel.
//!
//! Messages are newline-delimited JSON (NDJSON) when carried over a byte
//! stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ActionKind, ActionRequest};
use crate::error::ProtocolError;

/// One message on the channel.
///
/// The front end nests its payload under `data`. The kernel answers with
/// the payload fields flattened next to `action`; those land in `extra`.
/// [`Envelope::payload`] hides the difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// Correlation id echoed back by the backend.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Envelope for an outbound request.
    pub fn request(request: &ActionRequest, request_id: impl Into<String>) -> Self {
        Self {
            action: request.kind().as_str().to_string(),
            data: request.to_data(),
            request_id: Some(request_id.into()),
            extra: Map::new(),
        }
    }

    /// Envelope with a flat payload, the shape the kernel sends.
    pub fn flat(kind: ActionKind, request_id: Option<String>, fields: Map<String, Value>) -> Self {
        Self {
            action: kind.as_str().to_string(),
            data: Value::Null,
            request_id,
            extra: fields,
        }
    }

    /// Resolve the action tag against the taxonomy.
    pub fn kind(&self) -> Result<ActionKind, ProtocolError> {
        self.action.parse()
    }

    /// The payload, whether it was nested under `data` or sent flat.
    pub fn payload(&self) -> Value {
        match &self.data {
            Value::Object(_) => self.data.clone(),
            _ => Value::Object(self.extra.clone()),
        }
    }

    /// Serialize to a JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Parse from raw line bytes. Bytes that are not UTF-8 are a parse error.
    pub fn from_slice(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }
}
