// Per-channel runtime session and its lifecycle state machine.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::{
    CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned,
};

use super::pipeline::DeliveryHandle;
use crate::error::{StreamError, StreamResult};

const EVENT_CAPACITY: usize = 16;

/// Lifecycle of a channel session.
///
/// ```text
/// Starting -> Running <-> SwitchingSource
///    |          |              |
///    +----------+--------------+--> Stopping -> Stopped
///    +----------+--------------+--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    SwitchingSource,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// States in which the session serves (or is about to serve) viewers
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::SwitchingSource)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Stopping | Self::Failed)
                | (Self::Running, Self::SwitchingSource | Self::Stopping | Self::Failed)
                | (Self::SwitchingSource, Self::Running | Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::SwitchingSource => "switching_source",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Broadcast on every state transition of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub channel_id: String,
    pub session_id: u64,
    pub from: SessionState,
    pub to: SessionState,
}

/// Point-in-time view of a session, as reported by `/streams/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub channel_id: String,
    pub session_id: u64,
    pub state: SessionState,
    pub source_url: String,
    pub program_name: String,
    pub pid: Option<u32>,
    pub viewers: usize,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

pub struct Session {
    id: u64,
    channel_id: String,
    state: RwLock<SessionState>,
    source_tx: watch::Sender<String>,
    program_name: RwLock<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    last_access: Mutex<Instant>,
    viewers: AtomicUsize,
    last_error: RwLock<Option<String>>,
    pid: Mutex<Option<u32>>,
    pub(crate) handle: tokio::sync::Mutex<Option<Box<dyn DeliveryHandle>>>,
    cancel: CancellationToken,
    events: broadcast::Sender<StateChange>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        channel_id: impl Into<String>,
        source_url: impl Into<String>,
        program_name: impl Into<String>,
    ) -> Self {
        let (source_tx, _) = watch::channel(source_url.into());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            channel_id: channel_id.into(),
            state: RwLock::new(SessionState::Starting),
            source_tx,
            program_name: RwLock::new(program_name.into()),
            started_at: Utc::now(),
            started: Instant::now(),
            last_access: Mutex::new(Instant::now()),
            viewers: AtomicUsize::new(0),
            last_error: RwLock::new(None),
            pid: Mutex::new(None),
            handle: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            events,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    #[must_use]
    pub fn source_url(&self) -> String {
        self.source_tx.borrow().clone()
    }

    /// Follow source changes made by the monitor loop.
    #[must_use]
    pub fn subscribe_source(&self) -> watch::Receiver<String> {
        self.source_tx.subscribe()
    }

    #[must_use]
    pub fn program_name(&self) -> String {
        self.program_name.read().clone()
    }

    /// Observe state transitions from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Resolves when the session is being torn down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// [`Session::cancelled`] without borrowing the session
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.cancel.clone().cancelled_owned()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            channel_id: self.channel_id.clone(),
            session_id: self.id,
            state: self.state(),
            source_url: self.source_url(),
            program_name: self.program_name(),
            pid: *self.pid.lock(),
            viewers: self.viewers(),
            uptime_seconds: self.uptime().as_secs(),
            idle_seconds: self.idle_for().as_secs(),
            started_at: self.started_at,
            last_error: self.last_error(),
        }
    }

    pub(crate) fn add_viewer(&self) {
        self.viewers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_viewer(&self) {
        let result = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::warn!(channel_id = %self.channel_id, "Viewer count released below zero");
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub(crate) fn transition(&self, next: SessionState) -> StreamResult<SessionState> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(StreamError::InvalidState(format!(
                    "channel {}: {from} -> {next}",
                    self.channel_id
                )));
            }
            *state = next;
            from
        };

        tracing::info!(
            channel_id = %self.channel_id,
            session_id = self.id,
            from = %from,
            to = %next,
            "Session state changed"
        );
        // no subscribers is fine
        let _ = self.events.send(StateChange {
            channel_id: self.channel_id.clone(),
            session_id: self.id,
            from,
            to: next,
        });
        Ok(from)
    }

    pub(crate) fn set_source(&self, source_url: &str, program_name: &str) {
        self.source_tx.send_replace(source_url.to_string());
        *self.program_name.write() = program_name.to_string();
    }

    pub(crate) fn set_program_name(&self, program_name: &str) {
        *self.program_name.write() = program_name.to_string();
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}
