//! MPEG transport stream packet alignment.
//!
//! Upstreams deliver TS over HTTP in chunks that ignore packet boundaries and
//! sometimes start mid-packet or carry junk. Players want a byte stream made
//! only of whole packets, each starting with the sync byte. The aligner buffers
//! input and emits exactly that.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
/// Garbage tolerated without a single valid packet before giving up
pub const MAX_RESYNC_BYTES: usize = 64 * 1024;
/// Upstream read size: 7 packets, the usual UDP/RTP payload
pub const READ_CHUNK_SIZE: usize = TS_PACKET_SIZE * 7;

const PROGRESS_LOG_EVERY: u64 = 5000;

#[derive(Debug, Default)]
pub struct TsPacketAligner {
    buffer: BytesMut,
    discarded_since_packet: usize,
    discarded_total: u64,
    packets: u64,
}

impl TsPacketAligner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE * 2),
            ..Self::default()
        }
    }

    /// Feed upstream bytes; returns every whole aligned packet now available
    /// (possibly none).
    ///
    /// Fails with `UpstreamProtocolError` once more than
    /// [`MAX_RESYNC_BYTES`] have been skipped without finding a packet.
    pub fn push(&mut self, chunk: &[u8]) -> StreamResult<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut out = BytesMut::new();

        while self.buffer.len() >= TS_PACKET_SIZE {
            if self.buffer[0] != SYNC_BYTE {
                let skipped = self.resync();
                warn!(skipped, "Discarded bytes before transport stream sync byte");
                if self.discarded_since_packet > MAX_RESYNC_BYTES {
                    return Err(StreamError::UpstreamProtocolError(format!(
                        "no transport stream sync byte in {} bytes",
                        self.discarded_since_packet
                    )));
                }
                continue;
            }

            out.extend_from_slice(&self.buffer.split_to(TS_PACKET_SIZE));
            self.discarded_since_packet = 0;
            self.packets += 1;
            if self.packets == 1 {
                debug!("First transport stream packet aligned");
            } else if self.packets % PROGRESS_LOG_EVERY == 0 {
                debug!(packets = self.packets, "Transport stream progress");
            }
        }

        Ok(out.freeze())
    }

    /// Skip to the next sync byte (or drop everything if there is none).
    fn resync(&mut self) -> usize {
        let skip = self.buffer[1..]
            .iter()
            .position(|&b| b == SYNC_BYTE)
            .map_or(self.buffer.len(), |pos| pos + 1);
        self.buffer.advance(skip);
        self.discarded_since_packet += skip;
        self.discarded_total += skip as u64;
        skip
    }

    /// Forget buffered bytes, e.g. when the upstream source changes.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarded_since_packet = 0;
    }

    #[must_use]
    pub const fn packets(&self) -> u64 {
        self.packets
    }

    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded_total
    }

    /// Bytes held back waiting for the rest of a packet
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
