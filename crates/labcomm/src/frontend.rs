//! The UI surface workflows talk to.
//!
//! Dialogs, popups, tabs and notifications belong to the host. Implement
//! [`FrontEnd`] to route them to a real UI; [`LogFrontEnd`] answers every
//! prompt with a preconfigured choice and writes everything else to the log.

use async_trait::async_trait;
use log::{error, info, warn};

/// Answer to "a live script with this name already exists".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionChoice {
    Overwrite,
    /// New file name, with or without the `.mlx` extension.
    Rename(String),
    Cancel,
}

/// Answer to a backend nudge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeChoice {
    Open,
    Ignore,
}

/// A window hosting the backend's sign-in page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupRequest {
    pub url: String,
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl PopupRequest {
    pub fn sign_in(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: "MATLAB Sign In".to_string(),
            width: 700,
            height: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    /// Long-running step started; stays until a success or error follows.
    Pending,
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Pending, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, message)
    }

    fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Host UI operations used by workflows and nudge handling.
#[async_trait]
pub trait FrontEnd: Send + Sync {
    /// Ask what to do when `file_name` already exists.
    async fn resolve_name_collision(&self, file_name: &str) -> CollisionChoice;

    /// Show the backend's nudge message for a notebook.
    async fn prompt_nudge(&self, notebook_id: &str, message: &str) -> NudgeChoice;

    fn open_popup(&self, request: &PopupRequest) -> Result<(), String>;

    /// Close the popup if one is open. Must tolerate being called twice.
    fn close_popup(&self);

    fn open_in_new_tab(&self, url: &str);

    fn notify(&self, notification: Notification);
}

/// Non-interactive front end for headless use.
#[derive(Debug, Clone)]
pub struct LogFrontEnd {
    collision: CollisionChoice,
    nudge: NudgeChoice,
}

impl LogFrontEnd {
    /// Cancels on collisions and ignores nudges.
    pub fn new() -> Self {
        Self {
            collision: CollisionChoice::Cancel,
            nudge: NudgeChoice::Ignore,
        }
    }

    pub fn with_collision(mut self, choice: CollisionChoice) -> Self {
        self.collision = choice;
        self
    }

    pub fn with_nudge(mut self, choice: NudgeChoice) -> Self {
        self.nudge = choice;
        self
    }
}

impl Default for LogFrontEnd {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrontEnd for LogFrontEnd {
    async fn resolve_name_collision(&self, file_name: &str) -> CollisionChoice {
        info!(
            "[labcomm-ui] {} already exists, answering {:?}",
            file_name, self.collision
        );
        self.collision.clone()
    }

    async fn prompt_nudge(&self, notebook_id: &str, message: &str) -> NudgeChoice {
        info!(
            "[labcomm-ui] Nudge for {}: {} (answering {:?})",
            notebook_id, message, self.nudge
        );
        self.nudge
    }

    fn open_popup(&self, request: &PopupRequest) -> Result<(), String> {
        warn!(
            "[labcomm-ui] {} required, open {} in a browser",
            request.title, request.url
        );
        Ok(())
    }

    fn close_popup(&self) {}

    fn open_in_new_tab(&self, url: &str) {
        info!("[labcomm-ui] Open {}", url);
    }

    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => error!("[labcomm-ui] {}", notification.message),
            _ => info!("[labcomm-ui] {}", notification.message),
        }
    }
}
