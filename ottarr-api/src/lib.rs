// ottarr API Library
//
// HTTP gateway in front of the channel supervisor

pub mod http;

// Re-export commonly used types
pub use http::{create_router, serve, AppState};
