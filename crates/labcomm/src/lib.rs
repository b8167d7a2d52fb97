//! labcomm - action dispatch and workflows between a notebook front end and
//! its compute backend.
//!
//! Each managed notebook owns one duplex [`channel::Channel`] (a Jupyter comm
//! in practice). Requests are typed actions sent on that channel; responses
//! arrive asynchronously and are matched back to their caller by correlation
//! id. On top of that sit the multi-step workflows: making sure the backend
//! is running and licensed, converting a notebook to a live script and
//! opening it in the backend's editor.
//!
//! The UI surface (dialogs, popups, notifications) is reached through the
//! [`frontend::FrontEnd`] trait so the core stays host-agnostic.

pub mod bridge;
pub mod channel;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod frontend;
pub mod line_transport;
pub mod notebook;
pub mod polling;
pub mod responder;
pub mod settings;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::Bridge;
pub use error::CommError;
pub use labcomm_protocol::{
    ActionKind, ActionRequest, ActionResponse, BackendState, Envelope, StatusRecord,
};
pub use settings::Settings;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a panicking thread poisoned it.
///
/// None of the guarded maps can be left half-updated by a panic, so the
/// data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
