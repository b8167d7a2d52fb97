//! Action construction, execution and response routing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labcomm_protocol::{ActionKind, ActionRequest, ActionResponse, Envelope, StatusRecord};
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::channel::ChannelRegistry;
use crate::correlator::{Correlator, Delivery};
use crate::error::CommError;
use crate::lock;
use crate::notebook::NotebookRef;

/// A typed action ready to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    kind: ActionKind,
    blocking: bool,
    notebook: Option<NotebookRef>,
}

impl Action {
    pub fn new(kind: ActionKind, blocking: bool) -> Self {
        Self {
            kind,
            blocking,
            notebook: None,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn notebook(&self) -> Option<&NotebookRef> {
        self.notebook.as_ref()
    }
}

/// Build an action from its wire tag.
///
/// Nudge actions act on a notebook and fail without one.
pub fn create_action(
    kind: &str,
    blocking: bool,
    notebook: Option<NotebookRef>,
) -> Result<Action, CommError> {
    let kind: ActionKind = kind.parse()?;
    if kind == ActionKind::Nudge && notebook.is_none() {
        return Err(CommError::MissingNotebookContext(kind));
    }
    Ok(Action {
        kind,
        blocking,
        notebook,
    })
}

/// How long blocking requests wait for their response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Hard deadline for Convert.
    pub convert: Duration,
    /// Deadline for every other kind. `None` waits until the channel closes.
    pub request: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            convert: Duration::from_secs(50),
            request: Some(Duration::from_secs(300)),
        }
    }
}

/// Sends actions on notebook channels and routes their responses.
///
/// Holds the last-known status and file-exists caches. They are diagnostic:
/// callers should use the values returned by each request.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    correlator: Correlator,
    timeouts: Timeouts,
    last_status: Mutex<Option<StatusRecord>>,
    last_file_exists: AtomicBool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>, timeouts: Timeouts) -> Self {
        Self {
            registry,
            correlator: Correlator::new(),
            timeouts,
            last_status: Mutex::new(None),
            last_file_exists: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Execute an action with an untyped payload.
    ///
    /// Returns the response for blocking actions, `None` for
    /// fire-and-forget ones.
    pub async fn execute(
        &self,
        notebook_id: &str,
        action: &Action,
        data: &Value,
    ) -> Result<Option<ActionResponse>, CommError> {
        let request = ActionRequest::from_payload(action.kind(), data).map_err(|e| {
            error!("[labcomm-dispatch] Rejected {} action: {}", action.kind(), e);
            CommError::from(e)
        })?;

        if action.is_blocking() {
            self.request(notebook_id, request).await.map(Some)
        } else {
            self.send(notebook_id, request).map(|_| None)
        }
    }

    /// Fire-and-forget. Returns the correlation id the request was sent with.
    pub fn send(&self, notebook_id: &str, request: ActionRequest) -> Result<String, CommError> {
        request.validate()?;
        let channel = self.registry.get(notebook_id)?;
        // Tracked so an untagged response to it does not settle someone else
        let request_id = self.correlator.track(notebook_id, request.kind());
        if let Err(e) = channel.send(&Envelope::request(&request, request_id.clone())) {
            self.correlator.cancel(&request_id);
            return Err(e);
        }
        info!(
            "[labcomm-dispatch] Sent {} ({}) without waiting",
            request.kind(),
            request_id
        );
        Ok(request_id)
    }

    /// Send a request and wait for its own response.
    pub async fn request(
        &self,
        notebook_id: &str,
        request: ActionRequest,
    ) -> Result<ActionResponse, CommError> {
        request.validate()?;
        let kind = request.kind();
        let channel = self.registry.get(notebook_id)?;

        // Register before sending so a fast response cannot race past us
        let (request_id, rx) = self.correlator.begin(notebook_id, kind);
        if let Err(e) = channel.send(&Envelope::request(&request, request_id.clone())) {
            error!("[labcomm-dispatch] Failed to send {}: {}", kind, e);
            self.correlator.cancel(&request_id);
            return Err(e);
        }
        // On timeout or when the caller drops us the entry stays queued
        // without a waiter until the backend answers it
        let _pending = PendingGuard {
            correlator: &self.correlator,
            request_id: &request_id,
        };
        debug!("[labcomm-dispatch] Sent {} ({})", kind, request_id);

        let received = match self.timeout_for(kind) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        "[labcomm-dispatch] {} ({}) timed out after {:?}",
                        kind, request_id, limit
                    );
                    return Err(if kind == ActionKind::Convert {
                        CommError::ConversionTimeout(limit)
                    } else {
                        CommError::RequestTimeout {
                            action: kind,
                            after: limit,
                        }
                    });
                }
            },
            None => rx.await,
        };

        // Sender dropped without an outcome: the correlator went away
        received.map_err(|_| CommError::ChannelClosed {
            notebook_id: notebook_id.to_string(),
            action: kind,
        })?
    }

    fn timeout_for(&self, kind: ActionKind) -> Option<Duration> {
        match kind {
            ActionKind::Convert => Some(self.timeouts.convert),
            _ => self.timeouts.request,
        }
    }

    /// Route an inbound response to the caller waiting for it.
    ///
    /// Caches are updated whether or not anyone is waiting.
    pub fn handle_response(
        &self,
        notebook_id: &str,
        envelope: &Envelope,
    ) -> Result<Delivery, CommError> {
        let kind = envelope.kind()?;
        if !kind.is_caller_initiated() {
            return Err(CommError::NotCallerInitiated(kind));
        }

        let outcome = ActionResponse::parse(kind, &envelope.payload()).map_err(CommError::from);
        match &outcome {
            Ok(response) => self.record(response),
            Err(e) if e.is_backend_error() => {
                error!("[labcomm-dispatch] Received error from backend: {}", e)
            }
            Err(e) => error!("[labcomm-dispatch] Malformed {} response: {}", kind, e),
        }

        let delivery = self.correlator.settle(
            notebook_id,
            kind,
            envelope.request_id.as_deref(),
            outcome,
        );
        if delivery == Delivery::Unmatched {
            debug!(
                "[labcomm-dispatch] No caller waiting for {} on {}",
                kind, notebook_id
            );
        }
        Ok(delivery)
    }

    fn record(&self, response: &ActionResponse) {
        match response {
            ActionResponse::Status(record) => {
                debug!(
                    "[labcomm-dispatch] Backend status: {} (licensed: {})",
                    record.status, record.is_licensed
                );
                *lock(&self.last_status) = Some(*record);
            }
            ActionResponse::FileExists(exists) => {
                self.last_file_exists.store(*exists, Ordering::Release);
            }
            ActionResponse::BackendStarted
            | ActionResponse::Converted { .. }
            | ActionResponse::EditOpened => {}
        }
    }

    pub fn last_status(&self) -> Option<StatusRecord> {
        *lock(&self.last_status)
    }

    pub fn last_file_exists(&self) -> bool {
        self.last_file_exists.load(Ordering::Acquire)
    }

    pub async fn status(&self, notebook_id: &str) -> Result<StatusRecord, CommError> {
        match self.request(notebook_id, ActionRequest::StatusQuery).await? {
            ActionResponse::Status(record) => Ok(record),
            other => Err(unexpected(ActionKind::StatusQuery, &other)),
        }
    }

    pub async fn start_backend(&self, notebook_id: &str) -> Result<(), CommError> {
        match self.request(notebook_id, ActionRequest::StartBackend).await? {
            ActionResponse::BackendStarted => Ok(()),
            other => Err(unexpected(ActionKind::StartBackend, &other)),
        }
    }

    pub async fn file_exists(&self, notebook_id: &str, path: &str) -> Result<bool, CommError> {
        let request = ActionRequest::CheckFileExists {
            mlx_file_path: path.to_string(),
        };
        match self.request(notebook_id, request).await? {
            ActionResponse::FileExists(exists) => Ok(exists),
            other => Err(unexpected(ActionKind::CheckFileExists, &other)),
        }
    }

    /// Convert a notebook. Resolves with the path the backend confirmed.
    pub async fn convert(
        &self,
        notebook_id: &str,
        ipynb_path: &str,
        mlx_path: &str,
    ) -> Result<String, CommError> {
        let request = ActionRequest::Convert {
            ipynb_file_path: ipynb_path.to_string(),
            mlx_file_path: mlx_path.to_string(),
        };
        match self.request(notebook_id, request).await? {
            ActionResponse::Converted { mlx_file_path } => Ok(mlx_file_path),
            other => Err(unexpected(ActionKind::Convert, &other)),
        }
    }

    pub async fn edit(&self, notebook_id: &str, mlx_path: &str) -> Result<(), CommError> {
        let request = ActionRequest::Edit {
            mlx_file_path: mlx_path.to_string(),
        };
        match self.request(notebook_id, request).await? {
            ActionResponse::EditOpened => Ok(()),
            other => Err(unexpected(ActionKind::Edit, &other)),
        }
    }
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.abandon(self.request_id);
    }
}

fn unexpected(kind: ActionKind, response: &ActionResponse) -> CommError {
    CommError::Protocol(format!("unexpected response to {}: {:?}", kind, response))
}
