//! The per-process entry point: owns the registry, dispatcher and
//! orchestrator, attaches notebooks and routes what their channels receive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use labcomm_protocol::{
    backend_error, ActionKind, ActionResponse, Envelope, Nudge, StatusRecord,
};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelRegistry, CommTransport};
use crate::dispatcher::{create_action, Dispatcher};
use crate::error::CommError;
use crate::frontend::{FrontEnd, NudgeChoice};
use crate::lock;
use crate::notebook::{KernelLanguageClassifier, NotebookClassifier, NotebookRef};
use crate::settings::Settings;
use crate::workflow::{Orchestrator, WorkflowConfig, WorkflowOutcome};

struct Attached {
    notebook: NotebookRef,
    pump: JoinHandle<()>,
}

pub struct Bridge {
    settings: Settings,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    frontend: Arc<dyn FrontEnd>,
    classifier: Box<dyn NotebookClassifier>,
    attached: Mutex<HashMap<String, Attached>>,
}

impl Bridge {
    /// Bridge managing notebooks whose kernel language is `settings.target_language`.
    pub fn new(settings: Settings, frontend: Arc<dyn FrontEnd>) -> Arc<Self> {
        let classifier = Box::new(KernelLanguageClassifier::new(
            settings.target_language.clone(),
        ));
        Self::with_classifier(settings, frontend, classifier)
    }

    pub fn with_classifier(
        settings: Settings,
        frontend: Arc<dyn FrontEnd>,
        classifier: Box<dyn NotebookClassifier>,
    ) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), settings.timeouts()));
        let orchestrator = Arc::new(Orchestrator::new(
            dispatcher.clone(),
            frontend.clone(),
            WorkflowConfig::from_settings(&settings),
        ));
        Arc::new(Self {
            settings,
            registry,
            dispatcher,
            orchestrator,
            frontend,
            classifier,
            attached: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Open a channel for a notebook if it is managed.
    ///
    /// `inbound` yields what the transport receives. Re-attaching a notebook
    /// replaces its previous channel. Unmanaged notebooks get no channel and
    /// their transport is closed.
    pub fn attach(
        self: &Arc<Self>,
        notebook: NotebookRef,
        transport: Box<dyn CommTransport>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Option<Arc<Channel>> {
        if !self.classifier.is_managed(&notebook) {
            debug!(
                "[labcomm-bridge] {} is not a managed notebook",
                notebook.path.display()
            );
            transport.close();
            return None;
        }

        if lock(&self.attached).contains_key(&notebook.id) {
            self.detach(&notebook.id);
        }

        let channel = Arc::new(Channel::new(notebook.id.clone(), transport));
        self.registry.register(notebook.id.clone(), channel.clone());
        let pump = tokio::spawn(pump_inbound(
            Arc::downgrade(self),
            notebook.id.clone(),
            channel.id().to_string(),
            inbound,
        ));
        info!(
            "[labcomm-bridge] Attached {} as {} ({})",
            notebook.path.display(),
            channel.target_name(),
            channel.id()
        );
        lock(&self.attached).insert(notebook.id.clone(), Attached { notebook, pump });
        Some(channel)
    }

    /// Close a notebook's channel and fail its in-flight requests.
    ///
    /// Returns whether the notebook was attached.
    pub fn detach(&self, notebook_id: &str) -> bool {
        let attached = lock(&self.attached).remove(notebook_id);
        if let Some(entry) = &attached {
            entry.pump.abort();
        }
        if let Some(channel) = self.registry.unregister(notebook_id) {
            channel.close();
        }
        let failed = self.dispatcher.correlator().fail_notebook(notebook_id);
        if attached.is_some() {
            info!(
                "[labcomm-bridge] Detached {} ({} request(s) failed)",
                notebook_id, failed
            );
        }
        attached.is_some()
    }

    /// Cancel workflows and detach every notebook.
    pub fn shutdown(&self) {
        info!("[labcomm-bridge] Shutting down");
        self.orchestrator.cancel();
        let ids: Vec<String> = lock(&self.attached).keys().cloned().collect();
        for id in ids {
            self.detach(&id);
        }
        for channel in self.registry.clear() {
            channel.close();
        }
    }

    pub fn notebook(&self, notebook_id: &str) -> Option<NotebookRef> {
        lock(&self.attached)
            .get(notebook_id)
            .map(|entry| entry.notebook.clone())
    }

    pub fn attached_notebooks(&self) -> Vec<String> {
        lock(&self.attached).keys().cloned().collect()
    }

    /// Route one inbound message. Nudges run on their own task.
    pub fn handle_inbound(self: &Arc<Self>, notebook_id: &str, envelope: Envelope) {
        match envelope.kind() {
            Ok(ActionKind::Nudge) => self.spawn_nudge(notebook_id, &envelope),
            Ok(_) => {
                if let Err(e) = self.dispatcher.handle_response(notebook_id, &envelope) {
                    warn!(
                        "[labcomm-bridge] Dropping response for {}: {}",
                        notebook_id, e
                    );
                }
            }
            Err(e) => warn!(
                "[labcomm-bridge] Dropping message for {}: {}",
                notebook_id, e
            ),
        }
    }

    fn spawn_nudge(self: &Arc<Self>, notebook_id: &str, envelope: &Envelope) {
        let payload = envelope.payload();
        // An error reply to a nudge we sent, not a prompt
        if let Some(message) = backend_error(&payload) {
            warn!(
                "[labcomm-bridge] Backend rejected nudge for {}: {}",
                notebook_id, message
            );
            return;
        }
        let nudge = match Nudge::from_payload(&payload) {
            Ok(nudge) => nudge,
            Err(e) => {
                warn!("[labcomm-bridge] Malformed nudge for {}: {}", notebook_id, e);
                return;
            }
        };
        let Some(notebook) = self.notebook(notebook_id) else {
            warn!("[labcomm-bridge] Nudge for unattached notebook {}", notebook_id);
            return;
        };

        let bridge = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.handle_nudge(&notebook, &nudge.msg).await {
                warn!(
                    "[labcomm-bridge] Nudge for {} not acted on: {}",
                    notebook.id, e
                );
            }
        });
    }

    /// Prompt the user with a backend nudge and convert & open on "Open".
    ///
    /// Returns `None` when the user ignored the nudge.
    pub async fn handle_nudge(
        &self,
        notebook: &NotebookRef,
        message: &str,
    ) -> Result<Option<WorkflowOutcome>, CommError> {
        if self.orchestrator.is_running(&notebook.id) {
            return Err(CommError::WorkflowInProgress(notebook.id.clone()));
        }
        match self.frontend.prompt_nudge(&notebook.id, message).await {
            NudgeChoice::Ignore => {
                debug!("[labcomm-bridge] Nudge ignored for {}", notebook.id);
                Ok(None)
            }
            NudgeChoice::Open => self.orchestrator.convert_and_open(notebook).await.map(Some),
        }
    }

    /// Dispatch an action by wire tag with an untyped payload.
    pub async fn dispatch(
        &self,
        notebook_id: &str,
        kind: &str,
        blocking: bool,
        payload: &Value,
    ) -> Result<Option<ActionResponse>, CommError> {
        let action = create_action(kind, blocking, self.notebook(notebook_id))?;
        self.dispatcher.execute(notebook_id, &action, payload).await
    }

    pub fn last_status(&self) -> Option<StatusRecord> {
        self.dispatcher.last_status()
    }

    pub fn last_file_exists(&self) -> bool {
        self.dispatcher.last_file_exists()
    }

    /// The channel closed from the other side.
    fn channel_closed(&self, notebook_id: &str, channel_id: &str) {
        let current = self.registry.get(notebook_id).ok();
        if current.is_some_and(|c| c.id() == channel_id) {
            info!("[labcomm-bridge] Channel for {} closed by peer", notebook_id);
            self.detach(notebook_id);
        }
    }
}

async fn pump_inbound(
    bridge: Weak<Bridge>,
    notebook_id: String,
    channel_id: String,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = inbound.recv().await {
        let Some(bridge) = bridge.upgrade() else {
            return;
        };
        bridge.handle_inbound(&notebook_id, envelope);
    }
    if let Some(bridge) = bridge.upgrade() {
        bridge.channel_closed(&notebook_id, &channel_id);
    }
}
