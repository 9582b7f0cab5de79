use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("No program currently scheduled on channel {0}")]
    NoActiveProgram(String),

    #[error("Channel {channel_id} did not become ready within {timeout:?}")]
    StartupTimeout { channel_id: String, timeout: Duration },

    #[error("Upstream connection failed: {0}")]
    UpstreamConnectFailure(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("Delivery process died: {0}")]
    ProcessDied(String),

    #[error("Source switch failed: {0}")]
    SwitchFailure(String),

    #[error("Session for channel {0} is still starting")]
    SessionStarting(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::UpstreamConnectFailure(err.to_string())
        } else {
            Self::UpstreamProtocolError(err.to_string())
        }
    }
}

impl From<nix::errno::Errno> for StreamError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from(err))
    }
}
