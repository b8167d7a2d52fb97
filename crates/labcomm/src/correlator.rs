//! Request/response correlation.
//!
//! Every outbound request gets its own correlation id
//! (`<notebook id>:<sequence>`) and its own pending handle. A response is
//! matched by the id it echoes back, so two notebooks (or two callers on the
//! same notebook) waiting on the same action kind never settle each other.
//!
//! Backends that do not echo `requestId` are still supported: such a
//! response settles the oldest pending request of the same kind on the same
//! notebook, which matches the FIFO delivery order of a single channel.
//! For that to hold, every request that went out keeps its place in the
//! queue until its response arrives: fire-and-forget sends are tracked
//! without a waiter, and a caller that gives up leaves its entry behind
//! for the late response to consume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use labcomm_protocol::{ActionKind, ActionResponse};
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::error::CommError;
use crate::lock;

/// Outcome delivered to a waiting caller.
pub type Reply = Result<ActionResponse, CommError>;

struct PendingRequest {
    notebook_id: String,
    kind: ActionKind,
    seq: u64,
    /// `None` once nobody is waiting for the outcome.
    reply: Option<oneshot::Sender<Reply>>,
}

/// Whether a settled outcome reached a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody was waiting: fire-and-forget request, timed-out caller, or a
    /// response nobody asked for.
    Unmatched,
}

/// Table of in-flight requests.
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_seq: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn insert(
        &self,
        notebook_id: &str,
        kind: ActionKind,
        reply: Option<oneshot::Sender<Reply>>,
    ) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("{}:{}", notebook_id, seq);
        lock(&self.pending).insert(
            request_id.clone(),
            PendingRequest {
                notebook_id: notebook_id.to_string(),
                kind,
                seq,
                reply,
            },
        );
        request_id
    }

    /// Register a pending request and return its id and handle.
    ///
    /// Call this before sending so a fast response cannot race past it.
    pub fn begin(&self, notebook_id: &str, kind: ActionKind) -> (String, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (self.insert(notebook_id, kind, Some(tx)), rx)
    }

    /// Register a request nobody will wait for.
    pub fn track(&self, notebook_id: &str, kind: ActionKind) -> String {
        self.insert(notebook_id, kind, None)
    }

    /// Stop waiting for a request that was sent. Its response is still
    /// expected and consumes the entry when it arrives.
    pub fn abandon(&self, request_id: &str) {
        if let Some(entry) = lock(&self.pending).get_mut(request_id) {
            entry.reply = None;
        }
    }

    /// Drop a request that never went out.
    pub fn cancel(&self, request_id: &str) -> bool {
        lock(&self.pending).remove(request_id).is_some()
    }

    /// Settle the request a response belongs to.
    pub fn settle(
        &self,
        notebook_id: &str,
        kind: ActionKind,
        request_id: Option<&str>,
        outcome: Reply,
    ) -> Delivery {
        let entry = {
            let mut pending = lock(&self.pending);
            let key = match request_id {
                Some(id) => pending
                    .get(id)
                    .filter(|p| p.kind == kind && p.notebook_id == notebook_id)
                    .map(|_| id.to_string()),
                None => pending
                    .iter()
                    .filter(|(_, p)| p.kind == kind && p.notebook_id == notebook_id)
                    .min_by_key(|(_, p)| p.seq)
                    .map(|(id, _)| id.clone()),
            };
            key.and_then(|k| pending.remove(&k))
        };

        match entry.and_then(|entry| entry.reply) {
            Some(reply) => {
                if reply.send(outcome).is_ok() {
                    Delivery::Delivered
                } else {
                    debug!(
                        "[labcomm-correlator] Caller for {} on {} went away",
                        kind, notebook_id
                    );
                    Delivery::Unmatched
                }
            }
            None => Delivery::Unmatched,
        }
    }

    /// Fail every pending request for a notebook and forget the ones nobody
    /// waits for. Returns how many waiting callers were failed.
    pub fn fail_notebook(&self, notebook_id: &str) -> usize {
        let waiting: Vec<(ActionKind, oneshot::Sender<Reply>)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.notebook_id == notebook_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| pending.remove(id))
                .filter_map(|p| {
                    let kind = p.kind;
                    p.reply.map(|reply| (kind, reply))
                })
                .collect()
        };

        if !waiting.is_empty() {
            warn!(
                "[labcomm-correlator] Failing {} pending request(s) for {}",
                waiting.len(),
                notebook_id
            );
        }

        let count = waiting.len();
        for (kind, reply) in waiting {
            let _ = reply.send(Err(CommError::ChannelClosed {
                notebook_id: notebook_id.to_string(),
                action: kind,
            }));
        }
        count
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    /// Requests sent and not yet answered, waited on or not.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Requests with a caller still waiting.
    pub fn waiting_count(&self) -> usize {
        lock(&self.pending)
            .values()
            .filter(|p| p.reply.is_some())
            .count()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
