use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// One scheduled event on a virtual channel.
///
/// `start` is inclusive and `stop` exclusive, both in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledProgram {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub source_url: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

impl ScheduledProgram {
    /// Whether `instant` falls inside `[start, stop)`
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.stop
    }
}

/// A named channel whose programs are ordered by start time and never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub programs: Vec<ScheduledProgram>,
}

/// Immutable snapshot of every virtual channel, keyed by channel id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    channels: BTreeMap<String, VirtualChannel>,
}

impl Schedule {
    pub fn new(channels: impl IntoIterator<Item = VirtualChannel>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|channel| (channel.id.clone(), channel))
                .collect(),
        }
    }

    /// Parse a schedule document.
    ///
    /// Accepts the flat `{channel_id: channel}` layout as well as the grouped
    /// `{group: {category, service_channels: [...]}}` layout emitted by the
    /// schedule builder. Programs without usable times or a source URL are
    /// skipped with a warning.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let document: RawDocument = serde_json::from_slice(data)?;
        let mut channels = BTreeMap::new();

        match document {
            RawDocument::Flat(entries) => {
                for (id, raw) in entries {
                    let channel = raw.into_channel(id, None);
                    channels.insert(channel.id.clone(), channel);
                }
            }
            RawDocument::Grouped(groups) => {
                for (group_name, group) in groups {
                    let category = group.category.clone().or(Some(group_name.clone()));
                    for raw in group.service_channels {
                        let Some(id) = raw.id.clone().filter(|id| !id.trim().is_empty()) else {
                            tracing::warn!(group = %group_name, "Skipping schedule channel without id");
                            continue;
                        };
                        let channel = raw.into_channel(id, category.clone());
                        if channels.contains_key(&channel.id) {
                            tracing::warn!(
                                channel_id = %channel.id,
                                group = %group_name,
                                "Duplicate channel id in schedule, later entry wins"
                            );
                        }
                        channels.insert(channel.id.clone(), channel);
                    }
                }
            }
        }

        Ok(Self { channels })
    }

    #[must_use]
    pub fn channel(&self, channel_id: &str) -> Option<&VirtualChannel> {
        self.channels.get(channel_id)
    }

    #[must_use]
    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &VirtualChannel> {
        self.channels.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Flat(BTreeMap<String, RawChannel>),
    Grouped(BTreeMap<String, RawGroup>),
}

#[derive(Deserialize)]
struct RawGroup {
    #[serde(default)]
    category: Option<String>,
    service_channels: Vec<RawChannel>,
}

#[derive(Deserialize)]
struct RawChannel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, alias = "name")]
    channel_name: Option<String>,
    #[serde(default)]
    icon_url: Option<String>,
    #[serde(default)]
    category: Option<String>,
    programs: Vec<RawProgram>,
}

impl RawChannel {
    fn into_channel(self, id: String, group_category: Option<String>) -> VirtualChannel {
        let mut programs: Vec<ScheduledProgram> = self
            .programs
            .into_iter()
            .filter_map(|raw| raw.into_program(&id))
            .collect();
        programs.sort_by_key(|p| p.start);

        VirtualChannel {
            name: self.channel_name.unwrap_or_else(|| id.clone()),
            icon_url: self.icon_url,
            category: self.category.or(group_category),
            programs,
            id,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawProgram {
    start: Option<String>,
    stop: Option<String>,
    start_dt: Option<String>,
    stop_dt: Option<String>,
    source_url: Option<String>,
    stream_url: Option<String>,
    program_name: Option<String>,
    title: Option<String>,
    description: Option<String>,
    icon_url: Option<String>,
}

impl RawProgram {
    fn into_program(self, channel_id: &str) -> Option<ScheduledProgram> {
        let start = first_timestamp([self.start_dt.as_deref(), self.start.as_deref()]);
        let stop = first_timestamp([self.stop_dt.as_deref(), self.stop.as_deref()]);
        let source_url = self
            .source_url
            .or(self.stream_url)
            .filter(|url| !url.trim().is_empty());
        let name = self
            .program_name
            .or(self.title)
            .unwrap_or_else(|| "Live".to_string());

        let (Some(start), Some(stop), Some(source_url)) = (start, stop, source_url) else {
            tracing::warn!(
                channel_id = %channel_id,
                program = %name,
                "Skipping program with missing start, stop or source url"
            );
            return None;
        };

        if stop <= start {
            tracing::warn!(
                channel_id = %channel_id,
                program = %name,
                %start,
                %stop,
                "Skipping program that ends before it starts"
            );
            return None;
        }

        Some(ScheduledProgram {
            start,
            stop,
            source_url,
            name,
            description: self.description.unwrap_or_default(),
            icon_url: self.icon_url,
        })
    }
}

fn first_timestamp<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<DateTime<Utc>> {
    candidates.into_iter().flatten().find_map(parse_timestamp)
}

/// Parse the timestamp spellings found in schedule documents.
///
/// RFC 3339 and XMLTV (`20240101120000 +0000`) carry an offset; offset-less
/// values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y%m%d%H%M%S %z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S %z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%d%H%M%S"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

impl TryFrom<&str> for Schedule {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_json(value.as_bytes())
    }
}
