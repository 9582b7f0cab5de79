pub mod schedule;

pub use schedule::{parse_timestamp, Schedule, ScheduledProgram, VirtualChannel};
