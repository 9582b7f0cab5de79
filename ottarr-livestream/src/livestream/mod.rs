// Channel session orchestration
//
// The supervisor owns one session per channel and drives it through the
// session state machine. Pipelines do the actual delivery work.

pub mod pipeline;
pub mod process;
pub mod session;
pub mod supervisor;

pub use pipeline::{DeliveryHandle, DeliveryPipeline, PassthroughPipeline};
pub use process::{ManagedProcess, ProcessSpec, Termination};
pub use session::{Session, SessionState, SessionStatus, StateChange};
pub use supervisor::{ChannelSupervisor, MonitorOutcome, SessionLease, StopReason, SupervisorConfig};
