// ottarr-livestream - Channel sessions and stream delivery for ottarr
//
// Architecture:
// - livestream/  - Session state machine, supervisor, process management
// - protocols/   - Delivery implementations (MPEG-TS passthrough, HLS remux)
//
// A channel has at most one session; every viewer of that channel shares it.

pub mod error;
pub mod livestream;
pub mod protocols;

// Re-exports for convenience
pub use error::{StreamError, StreamResult};
pub use livestream::{
    ChannelSupervisor, DeliveryHandle, DeliveryPipeline, PassthroughPipeline, Session,
    SessionLease, SessionState, SessionStatus, SupervisorConfig,
};
pub use protocols::hls::{HlsLayout, RemuxPipeline, RemuxSettings};
pub use protocols::passthrough::{UpstreamClient, UpstreamSettings};
