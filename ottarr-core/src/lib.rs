pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use models::schedule::{Schedule, ScheduledProgram, VirtualChannel};
pub use service::resolver;
pub use service::schedule_store::{ScheduleSource, ScheduleStore};
