// Delivery pipelines: what actually carries a channel's source to viewers.
//
// The supervisor only talks to these traits, so tests drive it with fakes and
// the two delivery modes share one state machine.

use async_trait::async_trait;
use ottarr_core::config::DeliveryMode;
use std::time::Duration;

use super::process::Termination;
use crate::error::StreamResult;

/// A running delivery for one channel, exclusively owned by its session.
#[async_trait]
pub trait DeliveryHandle: Send {
    /// OS process id, when the delivery is backed by a process
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Resolve once output is available. The caller bounds this with a timeout.
    async fn wait_ready(&mut self) -> StreamResult<()>;

    /// Non-blocking liveness check: `Some(reason)` once the delivery has died.
    fn poll_exit(&mut self) -> StreamResult<Option<String>>;

    /// Stop the delivery, waiting at most `grace` before forcing it.
    async fn terminate(&mut self, grace: Duration) -> StreamResult<Termination>;
}

/// Starts and restarts deliveries.
#[async_trait]
pub trait DeliveryPipeline: Send + Sync + 'static {
    fn mode(&self) -> DeliveryMode;

    async fn start(&self, channel_id: &str, source_url: &str)
        -> StreamResult<Box<dyn DeliveryHandle>>;

    /// Replace `current` with a delivery reading `source_url`.
    ///
    /// Consumes the old handle; on error the old delivery has already been
    /// stopped.
    async fn switch_source(
        &self,
        channel_id: &str,
        current: Box<dyn DeliveryHandle>,
        source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>>;

    /// Periodic housekeeping while the session runs.
    async fn maintain(&self, _channel_id: &str) -> StreamResult<()> {
        Ok(())
    }

    /// Release per-channel resources after the delivery stopped.
    async fn teardown(&self, _channel_id: &str) -> StreamResult<()> {
        Ok(())
    }
}

/// Passthrough delivery has no long-lived worker: every viewer request opens
/// its own upstream connection against the session's current source.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPipeline;

struct PassthroughHandle;

#[async_trait]
impl DeliveryHandle for PassthroughHandle {
    async fn wait_ready(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn poll_exit(&mut self) -> StreamResult<Option<String>> {
        Ok(None)
    }

    async fn terminate(&mut self, _grace: Duration) -> StreamResult<Termination> {
        // open transfers end when the session is cancelled
        Ok(Termination::AlreadyExited)
    }
}

#[async_trait]
impl DeliveryPipeline for PassthroughPipeline {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Passthrough
    }

    async fn start(
        &self,
        _channel_id: &str,
        _source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        Ok(Box::new(PassthroughHandle))
    }

    async fn switch_source(
        &self,
        _channel_id: &str,
        _current: Box<dyn DeliveryHandle>,
        _source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        Ok(Box::new(PassthroughHandle))
    }
}
