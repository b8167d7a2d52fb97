//! Adapter from Jupyter comm messages to envelopes.

use jupyter_protocol::JupyterMessageContent;

use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Pull the envelope out of a `comm_msg`.
///
/// Returns the comm id alongside the envelope, or `None` when the content is
/// not a `comm_msg` (opens and closes are handled by the channel owner).
pub fn comm_envelope(
    content: &JupyterMessageContent,
) -> Result<Option<(String, Envelope)>, ProtocolError> {
    match content {
        JupyterMessageContent::CommMsg(msg) => {
            let data = serde_json::to_value(&msg.data)?;
            let envelope: Envelope = serde_json::from_value(data)?;
            Ok(Some((msg.comm_id.0.clone(), envelope)))
        }
        _ => Ok(None),
    }
}
