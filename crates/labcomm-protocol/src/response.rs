//! Typed responses parsed from inbound payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionKind;
use crate::error::ProtocolError;

/// Running state reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Starting,
    Up,
    Stopping,
    #[serde(alias = "stopped")]
    Down,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Starting => write!(f, "starting"),
            BackendState::Up => write!(f, "up"),
            BackendState::Stopping => write!(f, "stopping"),
            BackendState::Down => write!(f, "down"),
            BackendState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Last reported backend status. Replaced wholesale on every status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: BackendState,
    #[serde(default)]
    pub is_licensed: bool,
}

impl StatusRecord {
    pub fn is_ready(&self) -> bool {
        self.status == BackendState::Up && self.is_licensed
    }
}

/// Unsolicited prompt pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nudge {
    #[serde(default)]
    pub msg: String,
}

impl Nudge {
    pub fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// A successful response to a caller-initiated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResponse {
    Status(StatusRecord),
    BackendStarted,
    FileExists(bool),
    Converted { mlx_file_path: String },
    EditOpened,
}

/// Extract the `error` field of a payload.
///
/// `null`, an empty string, and `false` all mean success.
pub fn backend_error(payload: &Value) -> Option<String> {
    match payload.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl ActionResponse {
    /// Parse the payload of a response to `kind`.
    ///
    /// An `error` field always wins over any other content.
    pub fn parse(kind: ActionKind, payload: &Value) -> Result<Self, ProtocolError> {
        if let Some(message) = backend_error(payload) {
            return Err(ProtocolError::Backend {
                action: kind,
                message,
            });
        }

        let missing = |field: &'static str| ProtocolError::MissingResponseField {
            action: kind,
            field,
        };

        match kind {
            ActionKind::StatusQuery => {
                let status = payload
                    .get("matlabStatus")
                    .filter(|v| v.is_object())
                    .ok_or_else(|| missing("matlabStatus"))?;
                let record: StatusRecord = serde_json::from_value(status.clone())?;
                Ok(ActionResponse::Status(record))
            }
            ActionKind::StartBackend => Ok(ActionResponse::BackendStarted),
            ActionKind::CheckFileExists => payload
                .get("exists")
                .and_then(Value::as_bool)
                .map(ActionResponse::FileExists)
                .ok_or_else(|| missing("exists")),
            ActionKind::Convert => payload
                .get("mlxFilePath")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(|path| ActionResponse::Converted {
                    mlx_file_path: path.to_string(),
                })
                .ok_or_else(|| missing("mlxFilePath")),
            ActionKind::Edit => Ok(ActionResponse::EditOpened),
            ActionKind::Nudge => Err(ProtocolError::NotCallerInitiated(kind)),
        }
    }
}
