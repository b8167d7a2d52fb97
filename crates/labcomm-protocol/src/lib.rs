//! Wire types for the action channel between a notebook front end and its
//! compute backend.
//!
//! Every message on the channel is an [`Envelope`]: an `action` tag naming
//! one member of the closed [`ActionKind`] taxonomy, a JSON payload, and an
//! optional `requestId` used to correlate a response with its request.
//!
//! # Features
//!
//! - Action taxonomy with stable wire names
//! - Typed request payloads with field validation
//! - Response parsing for both nested (`data`) and flat payload shapes
//! - NDJSON line encoding
//! - Extraction of envelopes from Jupyter `comm_msg` content

mod action;
mod comm;
mod envelope;
mod error;
mod response;

pub use action::{ActionKind, ActionRequest};
pub use comm::comm_envelope;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use response::{backend_error, ActionResponse, BackendState, Nudge, StatusRecord};
