pub mod resolver;
pub mod schedule_store;

pub use schedule_store::{ScheduleSource, ScheduleStore};
