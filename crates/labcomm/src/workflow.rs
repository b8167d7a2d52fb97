//! Multi-step workflows built on the dispatcher.
//!
//! - **Ensure ready**: start the backend, wait for licensing (with the
//!   sign-in popup open), then wait for it to come up.
//! - **Convert & open / convert & edit**: pick a destination, ensure the
//!   backend is ready, convert, then open the live script in the backend's
//!   editor. "Open" also brings up the backend UI in a new tab.
//!
//! Every step awaits the previous one; the first error aborts the rest and is
//! surfaced as a notification. Nothing already done is rolled back.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labcomm_protocol::{BackendState, StatusRecord};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::{CommError, PollCondition};
use crate::frontend::{CollisionChoice, FrontEnd, Notification, PopupRequest};
use crate::lock;
use crate::notebook::{with_live_script_extension, NotebookRef};
use crate::polling::{poll_until, PollPolicy};
use crate::settings::Settings;

/// Knobs for the workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Backend UI, used for the sign-in popup and the new tab.
    pub backend_url: String,
    pub server_root: Option<PathBuf>,
    pub license_policy: PollPolicy,
    pub start_policy: PollPolicy,
    pub open_delay: Duration,
}

impl WorkflowConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            backend_url: settings.backend_url(),
            server_root: settings.server_root.clone(),
            license_policy: settings.license_policy(),
            start_policy: settings.start_policy(),
            open_delay: settings.open_delay(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// How a conversion workflow ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed { mlx_file_path: String },
    /// The user cancelled at the name-collision prompt.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    OpenBackend,
    EditOnly,
}

/// Runs workflows for every notebook of one bridge.
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    frontend: Arc<dyn FrontEnd>,
    config: WorkflowConfig,
    in_flight: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        frontend: Arc<dyn FrontEnd>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            dispatcher,
            frontend,
            config,
            in_flight: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Cancel running workflows. Workflows started afterwards fail immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a conversion is running for the notebook.
    pub fn is_running(&self, notebook_id: &str) -> bool {
        lock(&self.in_flight).contains(notebook_id)
    }

    /// Open the backend UI in a new tab.
    pub fn open_backend(&self) {
        info!("[labcomm-workflow] Opening {}", self.config.backend_url);
        self.frontend.open_in_new_tab(&self.config.backend_url);
    }

    /// Make sure the backend is running and licensed. Returns its final status.
    pub async fn ensure_backend_ready(&self, notebook_id: &str) -> Result<StatusRecord, CommError> {
        info!("[labcomm-workflow] Ensuring backend is ready for {}", notebook_id);

        self.cancellable(self.dispatcher.start_backend(notebook_id))
            .await
            .map_err(|e| self.fail("Failed to start MATLAB", e))?;
        let mut status = self
            .cancellable(self.dispatcher.status(notebook_id))
            .await
            .map_err(|e| self.fail("Failed to start MATLAB", e))?;

        if !status.is_licensed {
            status = self.wait_for_license(notebook_id).await?;
        }
        if status.status != BackendState::Up {
            status = self.wait_for_startup(notebook_id).await?;
        }

        info!(
            "[labcomm-workflow] Backend ready for {} ({})",
            notebook_id, status.status
        );
        Ok(status)
    }

    async fn wait_for_license(&self, notebook_id: &str) -> Result<StatusRecord, CommError> {
        let popup = PopupRequest::sign_in(self.config.backend_url.clone());
        if let Err(e) = self.frontend.open_popup(&popup) {
            return Err(self.fail("Failed to license MATLAB", CommError::Popup(e)));
        }
        let _popup = PopupGuard {
            frontend: self.frontend.as_ref(),
        };

        self.frontend
            .notify(Notification::pending("Waiting for MATLAB to be licensed..."));
        let result = self
            .poll_status(
                notebook_id,
                self.config.license_policy,
                PollCondition::Licensed,
                |status| status.is_licensed,
            )
            .await;
        self.report(result, "MATLAB finished licensing", "Failed to license MATLAB")
    }

    async fn wait_for_startup(&self, notebook_id: &str) -> Result<StatusRecord, CommError> {
        self.frontend.notify(Notification::pending("Starting MATLAB..."));
        let result = self
            .poll_status(
                notebook_id,
                self.config.start_policy,
                PollCondition::BackendUp,
                |status| status.status == BackendState::Up,
            )
            .await;
        self.report(result, "MATLAB is running", "Failed to start MATLAB")
    }

    async fn poll_status(
        &self,
        notebook_id: &str,
        policy: PollPolicy,
        condition: PollCondition,
        done: fn(&StatusRecord) -> bool,
    ) -> Result<StatusRecord, CommError> {
        let dispatcher = &self.dispatcher;
        poll_until(policy, &self.cancel, condition, move |_| async move {
            let status = dispatcher.status(notebook_id).await?;
            Ok::<_, CommError>(done(&status).then_some(status))
        })
        .await
    }

    /// Pick where the live script goes. `None` means the user cancelled.
    pub async fn resolve_destination(
        &self,
        notebook: &NotebookRef,
    ) -> Result<Option<PathBuf>, CommError> {
        let default = notebook.default_live_script_path(self.config.server_root.as_deref());
        let exists = self
            .cancellable(self.dispatcher.file_exists(&notebook.id, &path_str(&default)))
            .await?;
        if !exists {
            return Ok(Some(default));
        }

        let file_name = default
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        loop {
            match self.frontend.resolve_name_collision(&file_name).await {
                CollisionChoice::Overwrite => return Ok(Some(default)),
                CollisionChoice::Cancel => return Ok(None),
                CollisionChoice::Rename(name) => {
                    let name = name.trim();
                    if name.is_empty() {
                        return Ok(None);
                    }
                    let renamed = with_live_script_extension(name);
                    if renamed == file_name {
                        self.frontend.notify(Notification::error(
                            "The new filename is the same as the old one. Please choose a different name.",
                        ));
                        continue;
                    }
                    return Ok(Some(default.with_file_name(renamed)));
                }
            }
        }
    }

    /// Convert the notebook, open the backend UI and open the result in its editor.
    pub async fn convert_and_open(
        &self,
        notebook: &NotebookRef,
    ) -> Result<WorkflowOutcome, CommError> {
        self.run_conversion(notebook, Finish::OpenBackend).await
    }

    /// Convert the notebook and open the result in the backend's editor.
    pub async fn convert_and_edit(
        &self,
        notebook: &NotebookRef,
    ) -> Result<WorkflowOutcome, CommError> {
        self.run_conversion(notebook, Finish::EditOnly).await
    }

    async fn run_conversion(
        &self,
        notebook: &NotebookRef,
        finish: Finish,
    ) -> Result<WorkflowOutcome, CommError> {
        let _running = self.begin(&notebook.id)?;

        let destination = match self.resolve_destination(notebook).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                info!(
                    "[labcomm-workflow] Conversion of {} cancelled by user",
                    notebook.path.display()
                );
                return Ok(WorkflowOutcome::Aborted);
            }
            Err(e) => return Err(self.fail("Failed to check for an existing live script", e)),
        };
        let destination = path_str(&destination);
        let source = path_str(&notebook.absolute_path(self.config.server_root.as_deref()));

        self.ensure_backend_ready(&notebook.id).await?;

        self.frontend
            .notify(Notification::pending("Waiting for conversion to complete..."));
        let converted = self
            .cancellable(self.dispatcher.convert(&notebook.id, &source, &destination))
            .await;
        let mlx_file_path = self.report(converted, "Conversion successful", "Failed conversion")?;

        if finish == Finish::OpenBackend {
            self.frontend.notify(Notification::info("Opening MATLAB..."));
            let frontend = self.frontend.clone();
            let url = self.config.backend_url.clone();
            let delay = self.config.open_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                frontend.open_in_new_tab(&url);
            });
        }

        self.cancellable(self.dispatcher.edit(&notebook.id, &destination))
            .await
            .map_err(|e| self.fail("Failed to open the live script in MATLAB", e))?;

        info!(
            "[labcomm-workflow] Converted {} to {}",
            source, mlx_file_path
        );
        Ok(WorkflowOutcome::Completed { mlx_file_path })
    }

    fn begin(&self, notebook_id: &str) -> Result<InFlight<'_>, CommError> {
        if !lock(&self.in_flight).insert(notebook_id.to_string()) {
            warn!(
                "[labcomm-workflow] Conversion already running for {}",
                notebook_id
            );
            return Err(CommError::WorkflowInProgress(notebook_id.to_string()));
        }
        Ok(InFlight {
            running: &self.in_flight,
            notebook_id: notebook_id.to_string(),
        })
    }

    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, CommError>>,
    ) -> Result<T, CommError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CommError::Cancelled),
            result = fut => result,
        }
    }

    fn report<T>(
        &self,
        result: Result<T, CommError>,
        success: &str,
        failure: &str,
    ) -> Result<T, CommError> {
        match result {
            Ok(value) => {
                self.frontend.notify(Notification::success(success));
                Ok(value)
            }
            Err(e) => Err(self.fail(failure, e)),
        }
    }

    fn fail(&self, message: &str, err: CommError) -> CommError {
        warn!("[labcomm-workflow] {}: {}", message, err);
        self.frontend.notify(Notification::error(message));
        err
    }
}

/// Closes the sign-in popup however the licensing step ends.
struct PopupGuard<'a> {
    frontend: &'a dyn FrontEnd,
}

impl Drop for PopupGuard<'_> {
    fn drop(&mut self) {
        self.frontend.close_popup();
    }
}

/// Marks a notebook as having a conversion running.
struct InFlight<'a> {
    running: &'a Mutex<HashSet<String>>,
    notebook_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.notebook_id);
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
