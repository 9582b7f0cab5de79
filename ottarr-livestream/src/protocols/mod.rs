pub mod hls;
pub mod mpegts;
pub mod passthrough;

pub use hls::{HlsLayout, RemuxPipeline, RemuxSettings};
pub use mpegts::TsPacketAligner;
pub use passthrough::{aligned_stream, raw_stream, ChunkResult, UpstreamClient, UpstreamSettings};
