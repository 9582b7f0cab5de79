use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connect and probe time ffmpeg needs on top of the first segment
pub const REMUX_STARTUP_MARGIN_SECONDS: u64 = 10;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub schedule: ScheduleConfig,
    pub streaming: StreamingConfig,
    pub remux: RemuxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where the schedule document comes from and how often it is re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Filesystem path or `http(s)://` URL of the schedule JSON
    pub source: String,
    pub reload_interval_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            source: "/output/schedule.json".to_string(),
            reload_interval_seconds: 60,
        }
    }
}

impl ScheduleConfig {
    #[must_use]
    pub const fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_seconds)
    }
}

/// How a channel's bytes reach the viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Upstream transport stream relayed per request, re-aligned to packet boundaries
    #[default]
    Passthrough,
    /// Persistent ffmpeg process producing an HLS window on disk
    Remux,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough => write!(f, "passthrough"),
            Self::Remux => write!(f, "remux"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub delivery: DeliveryMode,
    pub idle_timeout_seconds: u64,
    pub monitor_interval_seconds: u64,
    pub startup_timeout_seconds: u64,
    pub termination_grace_seconds: u64,
    pub upstream_connect_timeout_seconds: u64,
    pub upstream_read_timeout_seconds: u64,
    /// How often an open transfer refreshes its session's last-access marker
    pub touch_interval_seconds: u64,
    pub user_agent: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Passthrough,
            idle_timeout_seconds: 300,
            monitor_interval_seconds: 5,
            startup_timeout_seconds: 5,
            termination_grace_seconds: 5,
            upstream_connect_timeout_seconds: 30,
            upstream_read_timeout_seconds: 60,
            touch_interval_seconds: 5,
            user_agent: "Plex/1.0".to_string(),
        }
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    #[must_use]
    pub const fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }

    #[must_use]
    pub const fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_seconds)
    }

    #[must_use]
    pub const fn upstream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_read_timeout_seconds)
    }

    #[must_use]
    pub const fn touch_interval(&self) -> Duration {
        Duration::from_secs(self.touch_interval_seconds)
    }
}

/// ffmpeg remux settings (only used in `remux` delivery mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    pub ffmpeg_path: PathBuf,
    pub output_dir: PathBuf,
    pub segment_duration_seconds: u32,
    /// Segments listed in the live manifest
    pub playlist_size: u32,
    /// Segments kept on disk per channel
    pub max_segments: usize,
    /// Replaces `streaming.startup_timeout_seconds` in remux mode: readiness
    /// waits for the first finished segment
    pub startup_timeout_seconds: u64,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_dir: PathBuf::from("/tmp/ottarr/hls"),
            segment_duration_seconds: 4,
            playlist_size: 6,
            max_segments: 12,
            startup_timeout_seconds: 30,
        }
    }
}

impl RemuxConfig {
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Environment variables use the `OTTARR` prefix with `__` between
    /// nesting levels, e.g. `OTTARR__STREAMING__IDLE_TIMEOUT_SECONDS=120`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("OTTARR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// How long a new or switched delivery may take to become ready
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        match self.streaming.delivery {
            DeliveryMode::Passthrough => self.streaming.startup_timeout(),
            DeliveryMode::Remux => self.remux.startup_timeout(),
        }
    }

    /// Check the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if self.schedule.source.trim().is_empty() {
            errors.push("schedule.source must not be empty".to_string());
        }
        if self.schedule.reload_interval_seconds == 0 {
            errors.push("schedule.reload_interval_seconds must be non-zero".to_string());
        }

        let streaming = &self.streaming;
        for (name, value) in [
            ("idle_timeout_seconds", streaming.idle_timeout_seconds),
            ("monitor_interval_seconds", streaming.monitor_interval_seconds),
            ("startup_timeout_seconds", streaming.startup_timeout_seconds),
            ("upstream_connect_timeout_seconds", streaming.upstream_connect_timeout_seconds),
            ("upstream_read_timeout_seconds", streaming.upstream_read_timeout_seconds),
            ("touch_interval_seconds", streaming.touch_interval_seconds),
        ] {
            if value == 0 {
                errors.push(format!("streaming.{name} must be non-zero"));
            }
        }
        if streaming.touch_interval_seconds >= streaming.idle_timeout_seconds {
            errors.push(
                "streaming.touch_interval_seconds must be shorter than idle_timeout_seconds"
                    .to_string(),
            );
        }

        if streaming.delivery == DeliveryMode::Remux {
            let remux = &self.remux;
            if remux.ffmpeg_path.as_os_str().is_empty() {
                errors.push("remux.ffmpeg_path must not be empty".to_string());
            }
            if remux.output_dir.as_os_str().is_empty() {
                errors.push("remux.output_dir must not be empty".to_string());
            }
            if remux.segment_duration_seconds == 0 {
                errors.push("remux.segment_duration_seconds must be non-zero".to_string());
            }
            if remux.playlist_size == 0 {
                errors.push("remux.playlist_size must be non-zero".to_string());
            }
            if remux.max_segments < remux.playlist_size as usize {
                errors.push(format!(
                    "remux.max_segments ({}) must be at least remux.playlist_size ({})",
                    remux.max_segments, remux.playlist_size
                ));
            }
            let min_startup =
                u64::from(remux.segment_duration_seconds) + REMUX_STARTUP_MARGIN_SECONDS;
            if remux.startup_timeout_seconds < min_startup {
                errors.push(format!(
                    "remux.startup_timeout_seconds ({}) must be at least {min_startup} \
                     (segment_duration_seconds + {REMUX_STARTUP_MARGIN_SECONDS})",
                    remux.startup_timeout_seconds
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
