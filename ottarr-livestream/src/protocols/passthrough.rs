//! Per-request upstream relay for passthrough delivery.
//!
//! Each viewer request gets its own upstream connection to the session's
//! current source. Bytes are re-aligned to transport stream packets before
//! they reach the client. When the monitor loop moves the session to a new
//! source, the relay reconnects and keeps writing into the same response.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use ottarr_core::config::StreamingConfig;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn, Instrument};

use super::mpegts::TsPacketAligner;
use crate::error::{StreamError, StreamResult};
use crate::livestream::SessionLease;

const RELAY_CHANNEL_CAPACITY: usize = 32;

/// Body item type for streamed responses
pub type ChunkResult = Result<Bytes, io::Error>;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub touch_interval: Duration,
    pub user_agent: String,
}

impl From<&StreamingConfig> for UpstreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            connect_timeout: config.upstream_connect_timeout(),
            read_timeout: config.upstream_read_timeout(),
            touch_interval: config.touch_interval(),
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

/// HTTP client for upstream sources.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    settings: Arc<UpstreamSettings>,
}

impl UpstreamClient {
    pub fn new(settings: UpstreamSettings) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| StreamError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &UpstreamSettings {
        &self.settings
    }

    /// GET `url`, optionally forwarding a client `Range` header verbatim.
    ///
    /// Success statuses and `416` (for ranged requests) are returned to the
    /// caller; anything else is an `UpstreamConnectFailure`.
    pub async fn open(&self, url: &str, range: Option<&str>) -> StreamResult<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }

        let response = tokio::time::timeout(self.settings.connect_timeout, request.send())
            .await
            .map_err(|_| {
                StreamError::UpstreamTimeout(format!(
                    "no response from {url} within {:?}",
                    self.settings.connect_timeout
                ))
            })??;

        let status = response.status();
        let range_not_satisfiable =
            range.is_some() && status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE;
        if !status.is_success() && !range_not_satisfiable {
            return Err(StreamError::UpstreamConnectFailure(format!(
                "{url} returned {status}"
            )));
        }

        debug!(url = %url, %status, range = ?range, "Upstream connected");
        Ok(response)
    }
}

/// Relay `response` as aligned transport stream packets.
///
/// The returned stream ends when upstream closes or stalls past the read
/// timeout, or when the session is torn down. Dropping it (client
/// disconnect) stops the relay and releases the lease.
pub fn aligned_stream(
    client: UpstreamClient,
    lease: SessionLease,
    response: reqwest::Response,
) -> ReceiverStream<ChunkResult> {
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    let span = tracing::info_span!(
        "passthrough_relay",
        channel_id = %lease.session().channel_id(),
        session_id = lease.session().id()
    );
    tokio::spawn(relay(client, lease, response, tx).instrument(span));
    ReceiverStream::new(rx)
}

/// Forward `response` byte-for-byte (ranged responses), holding the lease
/// until the body is done or the session is torn down.
pub fn raw_stream(
    lease: SessionLease,
    response: reqwest::Response,
) -> impl Stream<Item = ChunkResult> + Send + 'static {
    let ended = lease.session().cancelled_owned();
    response
        .bytes_stream()
        .map(move |chunk| {
            lease.touch();
            chunk.map_err(io::Error::other)
        })
        .take_until(ended)
}

enum RelayEvent {
    ClientGone,
    SessionEnded,
    SourceChanged,
    Touch,
    ReadTimeout,
    Chunk(reqwest::Result<Option<Bytes>>),
}

#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    Sent,
    ClientGone,
    SessionEnded,
}

/// Queue `packets` for the client. A slow reader still counts as watching,
/// so the lease keeps being touched while the queue is full.
async fn forward(
    tx: &mpsc::Sender<ChunkResult>,
    lease: &SessionLease,
    touch: &mut Interval,
    packets: Bytes,
) -> Forwarded {
    let send = tx.send(Ok(packets));
    tokio::pin!(send);
    loop {
        tokio::select! {
            sent = &mut send => {
                return if sent.is_ok() { Forwarded::Sent } else { Forwarded::ClientGone };
            }
            () = lease.session().cancelled() => return Forwarded::SessionEnded,
            _ = touch.tick() => lease.touch(),
        }
    }
}

async fn relay(
    client: UpstreamClient,
    lease: SessionLease,
    mut response: reqwest::Response,
    tx: mpsc::Sender<ChunkResult>,
) {
    let session = Arc::clone(lease.session());
    let mut source_rx = session.subscribe_source();

    let read_timeout = client.settings().read_timeout;
    let mut touch = tokio::time::interval(client.settings().touch_interval);
    let mut aligner = TsPacketAligner::new();
    let mut last_data = Instant::now();
    let mut bytes_sent: u64 = 0;

    info!(source_url = %session.source_url(), "Passthrough relay started");

    loop {
        let event = tokio::select! {
            () = tx.closed() => RelayEvent::ClientGone,
            () = session.cancelled() => RelayEvent::SessionEnded,
            changed = source_rx.changed() => {
                if changed.is_ok() { RelayEvent::SourceChanged } else { RelayEvent::SessionEnded }
            }
            _ = touch.tick() => RelayEvent::Touch,
            () = tokio::time::sleep_until(last_data + read_timeout) => RelayEvent::ReadTimeout,
            chunk = response.chunk() => RelayEvent::Chunk(chunk),
        };

        match event {
            RelayEvent::ClientGone => {
                info!("Client disconnected");
                break;
            }
            RelayEvent::SessionEnded => {
                info!("Session ended, closing relay");
                break;
            }
            RelayEvent::Touch => lease.touch(),
            RelayEvent::SourceChanged => {
                let url = source_rx.borrow_and_update().clone();
                info!(source_url = %url, "Source changed, reconnecting upstream");
                match client.open(&url, None).await {
                    Ok(next) => {
                        response = next;
                        aligner.reset();
                        last_data = Instant::now();
                    }
                    Err(e) => {
                        warn!(source_url = %url, "Failed to open new source: {}", e);
                        break;
                    }
                }
            }
            RelayEvent::ReadTimeout => {
                warn!(timeout = ?read_timeout, "Upstream stalled, closing relay");
                break;
            }
            RelayEvent::Chunk(Ok(Some(chunk))) => {
                last_data = Instant::now();
                match aligner.push(&chunk) {
                    Ok(packets) if packets.is_empty() => {}
                    Ok(packets) => {
                        bytes_sent += packets.len() as u64;
                        match forward(&tx, &lease, &mut touch, packets).await {
                            // upstream was not read while the client was behind
                            Forwarded::Sent => last_data = Instant::now(),
                            Forwarded::ClientGone => {
                                info!("Client disconnected");
                                break;
                            }
                            Forwarded::SessionEnded => {
                                info!("Session ended, closing relay");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                        break;
                    }
                }
            }
            RelayEvent::Chunk(Ok(None)) => {
                info!("Upstream closed");
                break;
            }
            RelayEvent::Chunk(Err(e)) => {
                warn!("Upstream read failed: {}", e);
                break;
            }
        }
    }

    info!(
        bytes_sent,
        packets = aligner.packets(),
        discarded = aligner.discarded(),
        "Passthrough relay finished"
    );
}
