//! Schedule lookups: which program is live on a channel at a given instant.
//!
//! Both functions are pure. Delivery decisions only ever use [`resolve`];
//! [`next`] exists for status reporting.

use chrono::{DateTime, Utc};

use crate::models::schedule::{ScheduledProgram, VirtualChannel};

/// The program whose `[start, stop)` interval contains `now`, if any.
#[must_use]
pub fn resolve(channel: &VirtualChannel, now: DateTime<Utc>) -> Option<&ScheduledProgram> {
    channel.programs.iter().find(|program| program.contains(now))
}

/// The first program starting strictly after `now`.
#[must_use]
pub fn next(channel: &VirtualChannel, now: DateTime<Utc>) -> Option<&ScheduledProgram> {
    channel.programs.iter().find(|program| program.start > now)
}
