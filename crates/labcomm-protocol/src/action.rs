//! The closed action taxonomy and typed request payloads.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;

/// Every action that can travel over the channel.
///
/// The serialized names are the tags the backend understands, so they must
/// never change independently of the kernel side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Query the backend's running state and license status.
    #[serde(rename = "matlab_status")]
    StatusQuery,
    /// Start the backend process. No-op on the backend if already running.
    #[serde(rename = "start_matlab_proxy")]
    StartBackend,
    /// Ask whether a file exists on the backend's filesystem.
    #[serde(rename = "check_file_exists")]
    CheckFileExists,
    /// Convert a notebook to a live script.
    #[serde(rename = "convert")]
    Convert,
    /// Open a live script in the backend's editor.
    #[serde(rename = "edit")]
    Edit,
    /// Unsolicited prompt pushed by the backend.
    #[serde(rename = "nudge")]
    Nudge,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::StatusQuery,
        ActionKind::StartBackend,
        ActionKind::CheckFileExists,
        ActionKind::Convert,
        ActionKind::Edit,
        ActionKind::Nudge,
    ];

    /// Wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::StatusQuery => "matlab_status",
            ActionKind::StartBackend => "start_matlab_proxy",
            ActionKind::CheckFileExists => "check_file_exists",
            ActionKind::Convert => "convert",
            ActionKind::Edit => "edit",
            ActionKind::Nudge => "nudge",
        }
    }

    /// Whether the front end sends requests of this kind.
    ///
    /// Nudges only ever flow from the backend to the front end.
    pub fn is_caller_initiated(&self) -> bool {
        !matches!(self, ActionKind::Nudge)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownActionKind(s.to_string()))
    }
}

/// A request the front end can send, with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    StatusQuery,
    StartBackend,
    CheckFileExists {
        mlx_file_path: String,
    },
    Convert {
        ipynb_file_path: String,
        mlx_file_path: String,
    },
    Edit {
        mlx_file_path: String,
    },
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionRequest::StatusQuery => ActionKind::StatusQuery,
            ActionRequest::StartBackend => ActionKind::StartBackend,
            ActionRequest::CheckFileExists { .. } => ActionKind::CheckFileExists,
            ActionRequest::Convert { .. } => ActionKind::Convert,
            ActionRequest::Edit { .. } => ActionKind::Edit,
        }
    }

    /// Build a request from an untyped payload, validating required fields.
    ///
    /// A field counts as missing when it is absent, not a string, or empty.
    pub fn from_payload(kind: ActionKind, data: &Value) -> Result<Self, ProtocolError> {
        let field = |name: &'static str| -> Result<String, ProtocolError> {
            data.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or(ProtocolError::MissingPayloadField {
                    action: kind,
                    field: name,
                })
        };

        match kind {
            ActionKind::StatusQuery => Ok(ActionRequest::StatusQuery),
            ActionKind::StartBackend => Ok(ActionRequest::StartBackend),
            ActionKind::CheckFileExists => Ok(ActionRequest::CheckFileExists {
                mlx_file_path: field("mlxFilePath")?,
            }),
            ActionKind::Convert => Ok(ActionRequest::Convert {
                ipynb_file_path: field("ipynbFilePath")?,
                mlx_file_path: field("mlxFilePath")?,
            }),
            ActionKind::Edit => Ok(ActionRequest::Edit {
                mlx_file_path: field("mlxFilePath")?,
            }),
            ActionKind::Nudge => Err(ProtocolError::NotCallerInitiated(kind)),
        }
    }

    /// Check that every path in the payload is non-empty.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let missing = |field: &'static str| ProtocolError::MissingPayloadField {
            action: self.kind(),
            field,
        };
        match self {
            ActionRequest::StatusQuery | ActionRequest::StartBackend => Ok(()),
            ActionRequest::CheckFileExists { mlx_file_path }
            | ActionRequest::Edit { mlx_file_path } => {
                if mlx_file_path.is_empty() {
                    return Err(missing("mlxFilePath"));
                }
                Ok(())
            }
            ActionRequest::Convert {
                ipynb_file_path,
                mlx_file_path,
            } => {
                if ipynb_file_path.is_empty() {
                    return Err(missing("ipynbFilePath"));
                }
                if mlx_file_path.is_empty() {
                    return Err(missing("mlxFilePath"));
                }
                Ok(())
            }
        }
    }

    /// The `data` object sent on the wire.
    pub fn to_data(&self) -> Value {
        match self {
            ActionRequest::StatusQuery | ActionRequest::StartBackend => json!({}),
            ActionRequest::CheckFileExists { mlx_file_path }
            | ActionRequest::Edit { mlx_file_path } => json!({ "mlxFilePath": mlx_file_path }),
            ActionRequest::Convert {
                ipynb_file_path,
                mlx_file_path,
            } => json!({
                "ipynbFilePath": ipynb_file_path,
                "mlxFilePath": mlx_file_path,
            }),
        }
    }
}
