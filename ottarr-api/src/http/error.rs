// HTTP error handling

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use ottarr_livestream::StreamError;
use std::fmt;

/// Seconds a client should wait before retrying a starting stream
const STARTING_RETRY_AFTER: u64 = 2;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code and a short plain-text reason
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    pub fn service_unavailable(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
        }
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.message,
        )
            .into_response();

        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from(seconds));
        }
        response
    }
}

/// Convert streaming errors to HTTP errors
impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::UnknownChannel(_) => Self::not_found("Channel not found"),
            StreamError::NoActiveProgram(_) => Self::not_found("No program currently scheduled"),
            StreamError::SessionStarting(_) => {
                Self::service_unavailable("Stream is starting", STARTING_RETRY_AFTER)
            }
            StreamError::StartupTimeout { .. } => {
                tracing::warn!("{}", err);
                Self::gateway_timeout("Stream did not start in time")
            }
            StreamError::UpstreamTimeout(_) => {
                tracing::warn!("{}", err);
                Self::gateway_timeout("Upstream timed out")
            }
            StreamError::UpstreamConnectFailure(_) | StreamError::UpstreamProtocolError(_) => {
                tracing::warn!("{}", err);
                Self::bad_gateway("Upstream unavailable")
            }
            StreamError::ProcessDied(_) | StreamError::SwitchFailure(_) => {
                tracing::warn!("{}", err);
                Self::bad_gateway("Stream process failed")
            }
            StreamError::InvalidState(_) | StreamError::Io(_) | StreamError::Internal(_) => {
                tracing::error!("Streaming error: {}", err);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert ottarr_core errors to HTTP errors
impl From<ottarr_core::Error> for AppError {
    fn from(err: ottarr_core::Error) -> Self {
        use ottarr_core::Error;

        match err {
            Error::NotFound(msg) => Self::not_found(msg),
            Error::InvalidInput(msg) => Self::bad_request(msg),
            Error::Http(msg) => {
                tracing::warn!("HTTP error: {}", msg);
                Self::bad_gateway("Upstream unavailable")
            }
            Error::Io(e) => {
                tracing::error!("I/O error: {}", e);
                Self::internal_server_error("Internal server error")
            }
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal_server_error("Data processing error")
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

/// Convert I/O errors to HTTP errors
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!("I/O error: {}", err);
        Self::internal_server_error("Internal server error")
    }
}
