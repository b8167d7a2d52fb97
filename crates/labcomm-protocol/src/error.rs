use crate::action::ActionKind;

/// Error type for envelope encoding, request validation and response parsing.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown action kind: {0}")]
    UnknownActionKind(String),

    #[error("Missing payload field `{field}` for {action} request")]
    MissingPayloadField {
        action: ActionKind,
        field: &'static str,
    },

    #[error("Response for {action} is missing `{field}`")]
    MissingResponseField {
        action: ActionKind,
        field: &'static str,
    },

    #[error("Backend returned error for {action}: {message}")]
    Backend { action: ActionKind, message: String },

    #[error("{0} is initiated by the backend and cannot be sent")]
    NotCallerInitiated(ActionKind),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
