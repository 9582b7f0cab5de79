//! Current schedule snapshot plus the machinery that refreshes it.
//!
//! Readers take an `Arc<Schedule>` and keep using it for as long as they like;
//! a reload swaps the whole snapshot, so nobody ever sees a half-applied
//! schedule. A failed reload leaves the last good snapshot in place.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::models::schedule::Schedule;
use crate::{Error, Result};

const HTTP_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Where schedule documents are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSource {
    File(PathBuf),
    Http(String),
    /// Fixed in memory; reloads are no-ops
    Static,
}

impl ScheduleSource {
    /// `http://` and `https://` locations are fetched, anything else is a path.
    #[must_use]
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Http(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }
}

impl std::fmt::Display for ScheduleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
            Self::Static => write!(f, "static"),
        }
    }
}

pub struct ScheduleStore {
    current: RwLock<Arc<Schedule>>,
    source: ScheduleSource,
    http: reqwest::Client,
}

impl ScheduleStore {
    /// Create an empty store; call [`ScheduleStore::reload`] to populate it.
    pub fn new(source: ScheduleSource) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            current: RwLock::new(Arc::new(Schedule::default())),
            source,
            http,
        })
    }

    /// A store holding a fixed schedule (tests and embedding).
    #[must_use]
    pub fn from_schedule(schedule: Schedule) -> Self {
        Self {
            current: RwLock::new(Arc::new(schedule)),
            source: ScheduleSource::Static,
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Schedule> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a new snapshot
    pub fn replace(&self, schedule: Schedule) {
        *self.current.write() = Arc::new(schedule);
    }

    #[must_use]
    pub const fn source(&self) -> &ScheduleSource {
        &self.source
    }

    /// Re-read the source and swap the snapshot in.
    ///
    /// Returns the number of channels now loaded. On error the previous
    /// snapshot is kept.
    pub async fn reload(&self) -> Result<usize> {
        let data = match &self.source {
            ScheduleSource::Static => return Ok(self.snapshot().len()),
            ScheduleSource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::NotFound(format!("schedule file {}", path.display()))
                } else {
                    Error::Io(e)
                }
            })?,
            ScheduleSource::Http(url) => {
                let response = self.http.get(url).send().await?;
                if !response.status().is_success() {
                    return Err(Error::Http(format!(
                        "schedule fetch returned {}",
                        response.status()
                    )));
                }
                response.bytes().await?.to_vec()
            }
        };

        let schedule = Schedule::from_json(&data)?;
        let channels = schedule.len();
        self.replace(schedule);
        debug!(source = %self.source, channels, "Schedule reloaded");
        Ok(channels)
    }

    /// Reload on a fixed interval until the returned handle is aborted.
    pub fn start_reload_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately; the initial load happens at startup
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.reload().await {
                    Ok(channels) => debug!(channels, "Periodic schedule reload complete"),
                    Err(e) => error!(
                        source = %store.source,
                        "Schedule reload failed, keeping last known good schedule: {}",
                        e
                    ),
                }
            }
        })
    }

    /// Initial load at startup. A missing or broken schedule is not fatal:
    /// the server comes up with no channels and the reload task retries.
    pub async fn load_initial(&self) {
        match self.reload().await {
            Ok(channels) => info!(source = %self.source, channels, "Schedule loaded"),
            Err(e) => error!(source = %self.source, "Initial schedule load failed: {}", e),
        }
    }
}
