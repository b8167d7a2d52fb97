//! Error taxonomy for channel, dispatch and workflow operations.

use std::time::Duration;

use labcomm_protocol::{ActionKind, ProtocolError};

/// What a polling loop was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCondition {
    Licensed,
    BackendUp,
}

impl std::fmt::Display for PollCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollCondition::Licensed => write!(f, "backend licensing"),
            PollCondition::BackendUp => write!(f, "backend startup"),
        }
    }
}

/// Error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("No communication channel found for notebook ID: {0}")]
    ChannelNotFound(String),

    #[error("Communication channel for notebook {0} is not available")]
    ChannelUnavailable(String),

    #[error("Channel for notebook {notebook_id} closed before the {action} response arrived")]
    ChannelClosed {
        notebook_id: String,
        action: ActionKind,
    },

    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("{0} actions need a notebook context")]
    MissingNotebookContext(ActionKind),

    #[error("{0} is initiated by the backend and cannot be executed")]
    NotCallerInitiated(ActionKind),

    #[error("Backend returned error for {action}: {message}")]
    BackendError { action: ActionKind, message: String },

    #[error("Missing payload field `{field}` for {action}")]
    MissingPayloadField {
        action: ActionKind,
        field: &'static str,
    },

    #[error("Response for {action} is missing `{field}`")]
    MissingResponseField {
        action: ActionKind,
        field: &'static str,
    },

    #[error("Conversion process timed out after {0:?}")]
    ConversionTimeout(Duration),

    #[error("Timed out waiting for {action} response after {after:?}")]
    RequestTimeout { action: ActionKind, after: Duration },

    #[error("Gave up waiting for {condition} after {attempts} attempts")]
    PollTimeout {
        condition: PollCondition,
        attempts: u32,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("A conversion is already running for notebook {0}")]
    WorkflowInProgress(String),

    #[error("Failed to open popup: {0}")]
    Popup(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for CommError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownActionKind(kind) => CommError::UnknownActionKind(kind),
            ProtocolError::MissingPayloadField { action, field } => {
                CommError::MissingPayloadField { action, field }
            }
            ProtocolError::MissingResponseField { action, field } => {
                CommError::MissingResponseField { action, field }
            }
            ProtocolError::Backend { action, message } => {
                CommError::BackendError { action, message }
            }
            ProtocolError::NotCallerInitiated(kind) => CommError::NotCallerInitiated(kind),
            ProtocolError::Json(e) => CommError::Protocol(e.to_string()),
        }
    }
}

impl CommError {
    /// Errors reported by the backend itself, as opposed to local failures.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, CommError::BackendError { .. })
    }
}
