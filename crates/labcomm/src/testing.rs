//! Shared fixtures for unit tests: scripted backends and a recording front end.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use labcomm_protocol::{ActionKind, BackendState, Envelope, StatusRecord};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelRegistry, MemoryTransport};
use crate::dispatcher::Dispatcher;
use crate::frontend::{CollisionChoice, FrontEnd, Notification, NudgeChoice, PopupRequest};

/// A response the scripted backend sends after `delay`.
pub(crate) struct Scripted {
    pub delay: Duration,
    pub response: Envelope,
}

impl Scripted {
    pub fn now(response: Envelope) -> Self {
        Self::after(Duration::ZERO, response)
    }

    pub fn after(delay: Duration, response: Envelope) -> Self {
        Self { delay, response }
    }
}

/// Build a flat response to `request`, echoing its correlation id.
pub(crate) fn reply(request: &Envelope, fields: Value) -> Envelope {
    let kind = request.kind().unwrap();
    let fields = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Envelope::flat(kind, request.request_id.clone(), fields)
}

/// Register an in-memory channel and return the receiver of what it sends.
pub(crate) fn attach_memory(
    registry: &ChannelRegistry,
    notebook_id: &str,
) -> mpsc::UnboundedReceiver<Envelope> {
    let (transport, rx) = MemoryTransport::pair();
    registry.register(
        notebook_id,
        Arc::new(Channel::new(notebook_id, Box::new(transport))),
    );
    rx
}

pub(crate) type Recorded = Arc<Mutex<Vec<(Instant, Envelope)>>>;

/// Answer requests with `script`, delivering responses to the dispatcher.
///
/// Every request is recorded with the time it was received.
pub(crate) fn spawn_backend<F>(
    dispatcher: Arc<Dispatcher>,
    notebook_id: &str,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut script: F,
) -> Recorded
where
    F: FnMut(&Envelope) -> Option<Scripted> + Send + 'static,
{
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let log = recorded.clone();
    let notebook_id = notebook_id.to_string();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            log.lock().unwrap().push((Instant::now(), envelope.clone()));
            if let Some(scripted) = script(&envelope) {
                let dispatcher = dispatcher.clone();
                let notebook_id = notebook_id.clone();
                tokio::spawn(async move {
                    if !scripted.delay.is_zero() {
                        tokio::time::sleep(scripted.delay).await;
                    }
                    let _ = dispatcher.handle_response(&notebook_id, &scripted.response);
                });
            }
        }
    });
    recorded
}

pub(crate) fn actions(recorded: &Recorded) -> Vec<String> {
    recorded
        .lock()
        .unwrap()
        .iter()
        .map(|(_, env)| env.action.clone())
        .collect()
}

pub(crate) fn times_of(recorded: &Recorded, kind: ActionKind) -> Vec<Instant> {
    recorded
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, env)| env.action == kind.as_str())
        .map(|(at, _)| *at)
        .collect()
}

/// State of a simulated backend.
pub(crate) struct SimState {
    /// Status answers, consumed in order; up and licensed once drained.
    pub statuses: VecDeque<StatusRecord>,
    pub existing: HashSet<String>,
    pub convert_delay: Duration,
    /// `false` never answers conversions.
    pub convert_replies: bool,
    pub convert_error: Option<String>,
    pub edit_error: Option<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            statuses: VecDeque::new(),
            existing: HashSet::new(),
            convert_delay: Duration::ZERO,
            convert_replies: true,
            convert_error: None,
            edit_error: None,
        }
    }
}

pub(crate) fn record(status: BackendState, is_licensed: bool) -> StatusRecord {
    StatusRecord {
        status,
        is_licensed,
    }
}

/// Script simulating the kernel side of every action.
pub(crate) fn simulate(state: SimState) -> impl FnMut(&Envelope) -> Option<Scripted> + Send + 'static {
    let mut state = state;
    move |env| {
        let data = env.payload();
        let path = data["mlxFilePath"].as_str().unwrap_or_default().to_string();
        match env.kind().unwrap() {
            ActionKind::StatusQuery => {
                let status = state
                    .statuses
                    .pop_front()
                    .unwrap_or(record(BackendState::Up, true));
                Some(Scripted::now(reply(
                    env,
                    json!({ "matlabStatus": status, "error": null }),
                )))
            }
            ActionKind::StartBackend => Some(Scripted::now(reply(env, json!({ "error": null })))),
            ActionKind::CheckFileExists => Some(Scripted::now(reply(
                env,
                json!({ "exists": state.existing.contains(&path), "error": null }),
            ))),
            ActionKind::Convert => {
                if !state.convert_replies {
                    return None;
                }
                let fields = match &state.convert_error {
                    Some(e) => json!({ "mlxFilePath": null, "error": e }),
                    None => json!({ "mlxFilePath": path, "error": null }),
                };
                Some(Scripted::after(state.convert_delay, reply(env, fields)))
            }
            ActionKind::Edit => Some(Scripted::now(reply(
                env,
                json!({ "error": state.edit_error }),
            ))),
            ActionKind::Nudge => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UiEvent {
    Collision(String),
    Nudge(String, String),
    PopupOpened(PopupRequest),
    PopupClosed,
    Tab(String),
    Notified(Notification),
}

/// Front end that answers from queues and records everything.
pub(crate) struct RecordingFrontEnd {
    collisions: Mutex<VecDeque<CollisionChoice>>,
    nudge: NudgeChoice,
    popup_error: Option<String>,
    events: Mutex<Vec<(Instant, UiEvent)>>,
}

impl RecordingFrontEnd {
    pub fn new() -> Self {
        Self {
            collisions: Mutex::new(VecDeque::new()),
            nudge: NudgeChoice::Ignore,
            popup_error: None,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_collisions(self, choices: impl IntoIterator<Item = CollisionChoice>) -> Self {
        *self.collisions.lock().unwrap() = choices.into_iter().collect();
        self
    }

    pub fn with_nudge(mut self, choice: NudgeChoice) -> Self {
        self.nudge = choice;
        self
    }

    pub fn with_popup_error(mut self, message: &str) -> Self {
        self.popup_error = Some(message.to_string());
        self
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, UiEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Notified(n) => Some(n.message),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &UiEvent) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

#[async_trait]
impl FrontEnd for RecordingFrontEnd {
    async fn resolve_name_collision(&self, file_name: &str) -> CollisionChoice {
        self.push(UiEvent::Collision(file_name.to_string()));
        self.collisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CollisionChoice::Cancel)
    }

    async fn prompt_nudge(&self, notebook_id: &str, message: &str) -> NudgeChoice {
        self.push(UiEvent::Nudge(notebook_id.to_string(), message.to_string()));
        self.nudge
    }

    fn open_popup(&self, request: &PopupRequest) -> Result<(), String> {
        if let Some(e) = &self.popup_error {
            return Err(e.clone());
        }
        self.push(UiEvent::PopupOpened(request.clone()));
        Ok(())
    }

    fn close_popup(&self) {
        self.push(UiEvent::PopupClosed);
    }

    fn open_in_new_tab(&self, url: &str) {
        self.push(UiEvent::Tab(url.to_string()));
    }

    fn notify(&self, notification: Notification) {
        self.push(UiEvent::Notified(notification));
    }
}
