// Channel supervisor: at most one delivery per channel, kept in line with the
// schedule.
//
// Sessions live in a DashMap. Every transition of a channel happens under
// that channel's async mutex, so acquire, the monitor loop and admin stop
// never interleave for the same channel while different channels proceed
// independently. Each running session has a monitor task that checks
// delivery health, idleness and the schedule on a fixed interval.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ottarr_core::config::StreamingConfig;
use ottarr_core::{resolver, Config, ScheduleStore, ScheduledProgram};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn, Instrument};

use super::pipeline::{DeliveryHandle, DeliveryPipeline};
use super::session::{Session, SessionState, SessionStatus};
use crate::error::{StreamError, StreamResult};

/// Timing knobs of the supervisor
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub idle_timeout: Duration,
    pub monitor_interval: Duration,
    pub startup_timeout: Duration,
    pub termination_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for SupervisorConfig {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            monitor_interval: config.monitor_interval(),
            startup_timeout: config.startup_timeout(),
            termination_grace: config.termination_grace(),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    /// Streaming timings with the startup timeout of the configured delivery mode
    fn from(config: &Config) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            ..Self::from(&config.streaming)
        }
    }
}

/// Why a session was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IdleTimeout,
    NoActiveProgram,
    Administrative,
}

/// Result of one monitor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Healthy,
    Switched { from: String, to: String },
    Stopped(StopReason),
    Failed(String),
    /// The session is no longer the channel's current live session
    Gone,
}

/// Holds a viewer slot on a session; releases it when dropped.
pub struct SessionLease {
    pub(crate) session: Arc<Session>,
}

impl SessionLease {
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn touch(&self) {
        self.session.touch();
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.remove_viewer();
        self.session.touch();
    }
}

pub struct ChannelSupervisor {
    schedule: Arc<ScheduleStore>,
    pipeline: Arc<dyn DeliveryPipeline>,
    sessions: DashMap<String, Arc<Session>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: SupervisorConfig,
    next_session_id: AtomicU64,
}

impl ChannelSupervisor {
    pub fn new(
        schedule: Arc<ScheduleStore>,
        pipeline: Arc<dyn DeliveryPipeline>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            schedule,
            pipeline,
            sessions: DashMap::new(),
            locks: DashMap::new(),
            config,
            next_session_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<dyn DeliveryPipeline> {
        &self.pipeline
    }

    /// Return the channel's live session, starting one if needed.
    ///
    /// Counts the caller as a viewer; pair with [`ChannelSupervisor::release`]
    /// or use [`ChannelSupervisor::lease`].
    pub async fn acquire(self: &Arc<Self>, channel_id: &str) -> StreamResult<Arc<Session>> {
        // Fast path: reuse a live session without taking the channel lock
        if let Some(session) = self.live_session(channel_id) {
            session.add_viewer();
            // a concurrent stop may have retired it since the lookup
            if session.state().is_live() && self.is_current(&session) {
                session.touch();
                return Ok(session);
            }
            session.remove_viewer();
        }

        if !self.schedule.snapshot().contains(channel_id) {
            return Err(StreamError::UnknownChannel(channel_id.to_string()));
        }

        let _guard = self.channel_lock(channel_id).await;

        // Re-check: another request may have started it while we waited
        if let Some(session) = self.live_session(channel_id) {
            session.add_viewer();
            session.touch();
            return Ok(session);
        }

        let snapshot = self.schedule.snapshot();
        let channel = snapshot
            .channel(channel_id)
            .ok_or_else(|| StreamError::UnknownChannel(channel_id.to_string()))?;
        let program = resolver::resolve(channel, Utc::now())
            .ok_or_else(|| StreamError::NoActiveProgram(channel_id.to_string()))?;

        let session = Arc::new(Session::new(
            self.next_session_id.fetch_add(1, Ordering::SeqCst),
            channel_id,
            &program.source_url,
            &program.name,
        ));
        self.sessions
            .insert(channel_id.to_string(), Arc::clone(&session));

        info!(
            channel_id = %channel_id,
            session_id = session.id(),
            source_url = %program.source_url,
            program = %program.name,
            mode = %self.pipeline.mode(),
            "Starting channel session"
        );

        if let Err(e) = self.start_delivery(&session, &program.source_url).await {
            self.fail(&session, &e).await;
            return Err(e);
        }

        session.transition(SessionState::Running)?;
        session.add_viewer();
        session.touch();
        self.spawn_monitor(Arc::clone(&session));
        Ok(session)
    }

    /// [`ChannelSupervisor::acquire`] wrapped in a guard that releases on drop.
    pub async fn lease(self: &Arc<Self>, channel_id: &str) -> StreamResult<SessionLease> {
        let session = self.acquire(channel_id).await?;
        Ok(SessionLease { session })
    }

    /// The consumer no longer needs the session. Never stops it; idle
    /// eviction does that once nobody has touched it for the idle timeout.
    pub fn release(&self, channel_id: &str) {
        if let Some(session) = self.session(channel_id) {
            session.remove_viewer();
            session.touch();
        }
    }

    /// Refresh the last-access marker of an existing live session.
    pub fn touch(&self, channel_id: &str) -> bool {
        match self.live_session(channel_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn session(&self, channel_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(channel_id).map(|s| Arc::clone(s.value()))
    }

    /// Snapshot of every tracked session
    #[must_use]
    pub fn status(&self) -> BTreeMap<String, SessionStatus> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state().is_live())
            .count()
    }

    /// Administrative stop. Returns whether there was a session to stop.
    pub async fn stop(&self, channel_id: &str) -> bool {
        if !self.sessions.contains_key(channel_id) {
            return false;
        }

        let _guard = self.channel_lock(channel_id).await;
        let Some(session) = self.session(channel_id) else {
            return false;
        };

        if session.state().is_live() {
            self.retire(&session, StopReason::Administrative).await;
        } else {
            // a failed session only lingers for status reporting
            self.sessions
                .remove_if(channel_id, |_, current| Arc::ptr_eq(current, &session));
        }
        true
    }

    /// Stop every session (process shutdown).
    pub async fn shutdown(&self) {
        let channel_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if channel_ids.is_empty() {
            return;
        }
        info!(sessions = channel_ids.len(), "Stopping all channel sessions");
        futures::future::join_all(channel_ids.iter().map(|id| self.stop(id))).await;
    }

    /// One monitor tick for the channel's current session, evaluated at `now`.
    pub async fn check_session(&self, channel_id: &str, now: DateTime<Utc>) -> MonitorOutcome {
        match self.session(channel_id) {
            Some(session) => self.check(&session, now).await,
            None => MonitorOutcome::Gone,
        }
    }

    fn live_session(&self, channel_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(channel_id)
            .filter(|s| s.state().is_live())
            .map(|s| Arc::clone(s.value()))
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .get(session.channel_id())
            .is_some_and(|current| Arc::ptr_eq(current.value(), session))
    }

    async fn channel_lock(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    async fn start_delivery(&self, session: &Session, source_url: &str) -> StreamResult<()> {
        let handle = self.pipeline.start(session.channel_id(), source_url).await?;
        let handle = self.await_ready(session, handle).await?;
        *session.handle.lock().await = Some(handle);
        Ok(())
    }

    /// Wait for readiness within the startup timeout; stops the handle on failure.
    async fn await_ready(
        &self,
        session: &Session,
        mut handle: Box<dyn DeliveryHandle>,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        session.set_pid(handle.pid());
        let timeout = self.config.startup_timeout;
        let error = match tokio::time::timeout(timeout, handle.wait_ready()).await {
            Ok(Ok(())) => return Ok(handle),
            Ok(Err(e)) => e,
            Err(_) => StreamError::StartupTimeout {
                channel_id: session.channel_id().to_string(),
                timeout,
            },
        };
        self.stop_handle(session, handle).await;
        Err(error)
    }

    async fn stop_handle(&self, session: &Session, mut handle: Box<dyn DeliveryHandle>) {
        session.set_pid(None);
        match handle.terminate(self.config.termination_grace).await {
            Ok(outcome) => debug!(channel_id = %session.channel_id(), ?outcome, "Delivery stopped"),
            Err(e) => warn!(channel_id = %session.channel_id(), "Failed to stop delivery: {}", e),
        }
    }

    fn spawn_monitor(self: &Arc<Self>, session: Arc<Session>) {
        let supervisor = Arc::clone(self);
        let span = tracing::info_span!(
            "channel_monitor",
            channel_id = %session.channel_id(),
            session_id = session.id()
        );
        tokio::spawn(async move { supervisor.monitor_loop(session).await }.instrument(span));
    }

    async fn monitor_loop(&self, session: Arc<Session>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = session.cancelled() => {
                    debug!("Monitor loop cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.check(&session, Utc::now()).await {
                MonitorOutcome::Healthy | MonitorOutcome::Switched { .. } => {}
                outcome => {
                    debug!(?outcome, "Monitor loop finished");
                    break;
                }
            }
        }
    }

    async fn check(&self, session: &Arc<Session>, now: DateTime<Utc>) -> MonitorOutcome {
        let channel_id = session.channel_id();
        let _guard = self.channel_lock(channel_id).await;

        if !self.is_current(session) || !session.state().is_live() {
            return MonitorOutcome::Gone;
        }

        // 1. delivery health
        let exit = match session.handle.lock().await.as_mut() {
            Some(handle) => handle.poll_exit(),
            None => Ok(Some("delivery handle missing".to_string())),
        };
        match exit {
            Ok(None) => {}
            Ok(Some(reason)) => {
                return self.fail(session, &StreamError::ProcessDied(reason)).await;
            }
            Err(e) => return self.fail(session, &e).await,
        }

        // 2. idleness
        let idle = session.idle_for();
        if idle > self.config.idle_timeout {
            info!(channel_id = %channel_id, idle = ?idle, "Session idle, stopping");
            self.retire(session, StopReason::IdleTimeout).await;
            return MonitorOutcome::Stopped(StopReason::IdleTimeout);
        }

        // 3. schedule
        let snapshot = self.schedule.snapshot();
        let program = snapshot
            .channel(channel_id)
            .and_then(|channel| resolver::resolve(channel, now))
            .cloned();
        let Some(program) = program else {
            info!(channel_id = %channel_id, "No program scheduled now, stopping");
            self.retire(session, StopReason::NoActiveProgram).await;
            return MonitorOutcome::Stopped(StopReason::NoActiveProgram);
        };

        if program.source_url != session.source_url() {
            return self.switch(session, &program).await;
        }
        if program.name != session.program_name() {
            session.set_program_name(&program.name);
        }

        // 4. housekeeping
        if let Err(e) = self.pipeline.maintain(channel_id).await {
            warn!(channel_id = %channel_id, "Pipeline maintenance failed: {}", e);
        }

        MonitorOutcome::Healthy
    }

    async fn switch(&self, session: &Arc<Session>, program: &ScheduledProgram) -> MonitorOutcome {
        let channel_id = session.channel_id();
        let from = session.source_url();

        if let Err(e) = session.transition(SessionState::SwitchingSource) {
            return self.fail(session, &e).await;
        }
        info!(
            channel_id = %channel_id,
            from = %from,
            to = %program.source_url,
            program = %program.name,
            "Switching source"
        );

        let Some(current) = session.handle.lock().await.take() else {
            let error = StreamError::SwitchFailure("delivery handle missing".to_string());
            return self.fail(session, &error).await;
        };
        session.set_pid(None);

        let switched = match self
            .pipeline
            .switch_source(channel_id, current, &program.source_url)
            .await
        {
            Ok(handle) => self.await_ready(session, handle).await,
            Err(e) => Err(e),
        };

        match switched {
            Ok(handle) => {
                *session.handle.lock().await = Some(handle);
                session.set_source(&program.source_url, &program.name);
                if let Err(e) = session.transition(SessionState::Running) {
                    return self.fail(session, &e).await;
                }
                MonitorOutcome::Switched {
                    from,
                    to: program.source_url.clone(),
                }
            }
            Err(e) => {
                let error = StreamError::SwitchFailure(e.to_string());
                self.fail(session, &error).await
            }
        }
    }

    /// Move a session to `Failed` and release everything it holds. The entry
    /// stays in the table so status can report it until a new session
    /// replaces it.
    async fn fail(&self, session: &Session, error: &StreamError) -> MonitorOutcome {
        let channel_id = session.channel_id();
        error!(channel_id = %channel_id, session_id = session.id(), "Session failed: {}", error);

        session.set_error(error.to_string());
        if let Err(e) = session.transition(SessionState::Failed) {
            warn!(channel_id = %channel_id, "{}", e);
        }
        session.cancel();

        let handle = session.handle.lock().await.take();
        if let Some(handle) = handle {
            self.stop_handle(session, handle).await;
        }
        if let Err(e) = self.pipeline.teardown(channel_id).await {
            warn!(channel_id = %channel_id, "Pipeline teardown failed: {}", e);
        }

        MonitorOutcome::Failed(error.to_string())
    }

    /// Stopping -> Stopped: stop the delivery, clean up, forget the session.
    async fn retire(&self, session: &Arc<Session>, reason: StopReason) {
        let channel_id = session.channel_id();
        if let Err(e) = session.transition(SessionState::Stopping) {
            warn!(channel_id = %channel_id, "{}", e);
            return;
        }
        info!(channel_id = %channel_id, session_id = session.id(), ?reason, "Stopping session");
        session.cancel();

        let handle = session.handle.lock().await.take();
        if let Some(handle) = handle {
            self.stop_handle(session, handle).await;
        }
        if let Err(e) = self.pipeline.teardown(channel_id).await {
            warn!(channel_id = %channel_id, "Pipeline teardown failed: {}", e);
        }

        if let Err(e) = session.transition(SessionState::Stopped) {
            warn!(channel_id = %channel_id, "{}", e);
        }
        self.sessions
            .remove_if(channel_id, |_, current| Arc::ptr_eq(current, session));
    }
}
