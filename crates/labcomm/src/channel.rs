//! Per-notebook duplex channels and the registry that owns them.
//!
//! A [`Channel`] wraps whatever physically carries messages (a Jupyter comm,
//! an NDJSON socket, an in-memory queue) behind [`CommTransport`]. Inbound
//! messages do not pass through the channel: the transport hands them to an
//! `mpsc` receiver that the [`crate::Bridge`] pumps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use labcomm_protocol::Envelope;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::error::CommError;
use crate::lock;

/// Outbound half of a physical channel.
pub trait CommTransport: Send + Sync {
    /// Queue an envelope for delivery. Must not block.
    fn send(&self, envelope: &Envelope) -> Result<(), String>;

    /// Close the underlying channel. Called at most once.
    fn close(&self);
}

/// A duplex endpoint scoped to exactly one notebook.
pub struct Channel {
    id: String,
    target_name: String,
    notebook_id: String,
    disposed: AtomicBool,
    transport: Box<dyn CommTransport>,
}

impl Channel {
    pub fn new(notebook_id: impl Into<String>, transport: Box<dyn CommTransport>) -> Self {
        let notebook_id = notebook_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_name: format!("matlab_comm_{}", notebook_id),
            notebook_id,
            disposed: AtomicBool::new(false),
            transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Send an envelope, failing fast if the channel is disposed or the
    /// transport rejects it.
    pub fn send(&self, envelope: &Envelope) -> Result<(), CommError> {
        if self.is_disposed() {
            return Err(CommError::ChannelUnavailable(self.notebook_id.clone()));
        }
        self.transport.send(envelope).map_err(|e| {
            debug!(
                "[labcomm-channel] Send on {} failed: {}",
                self.target_name, e
            );
            CommError::ChannelUnavailable(self.notebook_id.clone())
        })
    }

    /// Dispose the channel. Idempotent.
    pub fn close(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!(
                "[labcomm-channel] Closing channel {} ({})",
                self.target_name, self.id
            );
            self.transport.close();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("target_name", &self.target_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Notebook id -> channel mapping.
///
/// Pure storage: the registry never closes a channel by itself.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a channel. Last write wins; the replaced channel is returned.
    pub fn register(
        &self,
        notebook_id: impl Into<String>,
        channel: Arc<Channel>,
    ) -> Option<Arc<Channel>> {
        lock(&self.channels).insert(notebook_id.into(), channel)
    }

    pub fn get(&self, notebook_id: &str) -> Result<Arc<Channel>, CommError> {
        lock(&self.channels)
            .get(notebook_id)
            .cloned()
            .ok_or_else(|| CommError::ChannelNotFound(notebook_id.to_string()))
    }

    /// Remove a mapping. No error if it was absent.
    pub fn unregister(&self, notebook_id: &str) -> Option<Arc<Channel>> {
        lock(&self.channels).remove(notebook_id)
    }

    /// Remove every mapping, returning the channels that were registered.
    pub fn clear(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }
}

/// Transport that hands outbound envelopes to an in-process receiver.
///
/// Useful for hosts that already own a message loop and for tests.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl CommTransport for MemoryTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), String> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx
                .send(envelope.clone())
                .map_err(|_| "receiver dropped".to_string()),
            None => Err("transport closed".to_string()),
        }
    }

    fn close(&self) {
        lock(&self.tx).take();
    }
}
