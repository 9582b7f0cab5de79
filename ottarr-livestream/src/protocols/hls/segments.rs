//! On-disk layout of remuxed HLS output and the helpers that read it.
//!
//! ```text
//! <output_dir>/<channel>/input.ffconcat
//! <output_dir>/<channel>/index.m3u8
//! <output_dir>/<channel>/seg_00042.ts
//! ```

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::StreamResult;

pub const MANIFEST_NAME: &str = "index.m3u8";
pub const INPUT_NAME: &str = "input.ffconcat";
pub const SEGMENT_PREFIX: &str = "seg_";
pub const SEGMENT_PATTERN: &str = "seg_%05d.ts";

const SEGMENT_EXTENSIONS: [&str; 4] = ["ts", "m4s", "mp4", "aac"];

/// Escaped in directory names; `%` stays escaped so the mapping is one-to-one
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');
/// Escaped in URI path segments (everything but RFC 3986 unreserved)
const URI_ESCAPE: &AsciiSet = &PATH_ESCAPE.remove(b'~');
const MAX_SEGMENT_NAME_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct HlsLayout {
    root: PathBuf,
}

impl HlsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.root.join(sanitize_component(channel_id))
    }

    #[must_use]
    pub fn manifest_path(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(MANIFEST_NAME)
    }

    #[must_use]
    pub fn input_path(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(INPUT_NAME)
    }

    /// Path of a segment file, or `None` if the name could escape the
    /// channel directory or is not a media segment.
    #[must_use]
    pub fn segment_path(&self, channel_id: &str, segment: &str) -> Option<PathBuf> {
        is_valid_segment_name(segment).then(|| self.channel_dir(channel_id).join(segment))
    }
}

/// Map a channel id onto a single path component, distinct for distinct ids.
fn sanitize_component(channel_id: &str) -> String {
    let name = utf8_percent_encode(channel_id, PATH_ESCAPE).to_string();
    match name.strip_prefix('.') {
        // no hidden entries, no `.` or `..`
        Some(rest) => format!("%2E{rest}"),
        None if name.is_empty() => "%".to_string(),
        None => name,
    }
}

/// A channel id as it appears in a URI path segment
#[must_use]
pub fn uri_component(channel_id: &str) -> String {
    utf8_percent_encode(channel_id, URI_ESCAPE).to_string()
}

#[must_use]
pub fn is_valid_segment_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_SEGMENT_NAME_LEN || name.starts_with('.') {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SEGMENT_EXTENSIONS.contains(&ext))
}

/// Segment names referenced by a playlist, in playlist order.
#[must_use]
pub fn manifest_segments(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| basename(line).to_string())
        .collect()
}

/// Whether a playlist lists at least one playable segment
#[must_use]
pub fn manifest_has_segments(manifest: &str) -> bool {
    manifest.contains("#EXTINF") && !manifest_segments(manifest).is_empty()
}

/// Point every segment URI of a playlist at `uri_prefix`/`<segment name>`.
#[must_use]
pub fn rewrite_manifest(manifest: &str, uri_prefix: &str) -> String {
    let prefix = uri_prefix.trim_end_matches('/');
    let mut output = String::with_capacity(manifest.len() + 64);

    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            output.push_str(&rewrite_uri_attribute(line, prefix));
        } else if trimmed.is_empty() {
            output.push_str(line);
        } else {
            output.push_str(prefix);
            output.push('/');
            output.push_str(basename(trimmed));
        }
        output.push('\n');
    }

    output
}

/// Rewrite `URI="..."` inside tags such as `#EXT-X-MAP`.
fn rewrite_uri_attribute(line: &str, prefix: &str) -> String {
    let Some(start) = line.find("URI=\"") else {
        return line.to_string();
    };
    let value_start = start + "URI=\"".len();
    let Some(len) = line[value_start..].find('"') else {
        return line.to_string();
    };
    let value = &line[value_start..value_start + len];
    format!(
        "{}{}/{}{}",
        &line[..value_start],
        prefix,
        basename(value),
        &line[value_start + len..]
    )
}

fn basename(uri: &str) -> &str {
    let without_query = uri.split(['?', '#']).next().unwrap_or(uri);
    without_query.rsplit('/').next().unwrap_or(without_query)
}

/// Delete the oldest segment files beyond `keep`, never touching files the
/// current playlist still references. Returns how many were deleted.
pub async fn prune_segments(dir: &Path, keep: usize) -> StreamResult<usize> {
    let referenced: HashSet<String> = match tokio::fs::read_to_string(dir.join(MANIFEST_NAME)).await
    {
        Ok(manifest) => manifest_segments(&manifest).into_iter().collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
        Err(e) => return Err(e.into()),
    };

    let mut segments: Vec<(SystemTime, String)> = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SEGMENT_PREFIX) || !is_valid_segment_name(&name) {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        segments.push((modified, name));
    }

    if segments.len() <= keep {
        return Ok(0);
    }

    // oldest first; names are zero-padded so they break mtime ties in order
    segments.sort();
    let excess = segments.len() - keep;
    let mut deleted = 0;
    for (_, name) in segments.into_iter().take(excess) {
        if referenced.contains(&name) {
            continue;
        }
        match tokio::fs::remove_file(dir.join(&name)).await {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(segment = %name, "Failed to delete segment: {}", e),
        }
    }

    if deleted > 0 {
        debug!(dir = %dir.display(), deleted, "Pruned old segments");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:4.000000,\nseg_00007.ts\n#EXT-X-DISCONTINUITY\n#EXTINF:4.000000,\n/tmp/ottarr/hls/nba/seg_00008.ts\n";

    #[test]
    fn test_layout_paths() {
        let layout = HlsLayout::new("/srv/hls");
        assert_eq!(layout.manifest_path("nba"), PathBuf::from("/srv/hls/nba/index.m3u8"));
        assert_eq!(layout.input_path("nba"), PathBuf::from("/srv/hls/nba/input.ffconcat"));
        assert_eq!(layout.channel_dir("../etc"), PathBuf::from("/srv/hls/%2E.%2Fetc"));
        assert_eq!(layout.channel_dir("a/b c"), PathBuf::from("/srv/hls/a%2Fb%20c"));
        assert_eq!(layout.channel_dir(".."), PathBuf::from("/srv/hls/%2E."));
        assert_eq!(layout.channel_dir("espn.2"), PathBuf::from("/srv/hls/espn.2"));
        assert_eq!(
            layout.segment_path("nba", "seg_00001.ts"),
            Some(PathBuf::from("/srv/hls/nba/seg_00001.ts"))
        );
        assert_eq!(layout.segment_path("nba", "../index.m3u8"), None);
    }

    #[test]
    fn test_channel_dirs_are_distinct() {
        let layout = HlsLayout::new("/srv/hls");
        let ids = ["a b", "a_b", "a%20b", "a/b", "a%2Fb", ".a", "%2Ea", "", "%"];
        let dirs: HashSet<PathBuf> = ids.iter().map(|id| layout.channel_dir(id)).collect();
        assert_eq!(dirs.len(), ids.len());
        assert!(dirs.iter().all(|dir| dir.parent() == Some(Path::new("/srv/hls"))));
    }

    #[test]
    fn test_uri_component() {
        assert_eq!(uri_component("nba"), "nba");
        assert_eq!(uri_component("espn.2~hd"), "espn.2~hd");
        assert_eq!(uri_component("sky sports/1"), "sky%20sports%2F1");
        assert_eq!(uri_component("50%"), "50%25");
    }

    #[test]
    fn test_segment_name_validation() {
        assert!(is_valid_segment_name("seg_00001.ts"));
        assert!(is_valid_segment_name("init-0.mp4"));
        assert!(!is_valid_segment_name("index.m3u8"));
        assert!(!is_valid_segment_name("input.ffconcat"));
        assert!(!is_valid_segment_name("../seg_00001.ts"));
        assert!(!is_valid_segment_name(".hidden.ts"));
        assert!(!is_valid_segment_name("seg 1.ts"));
        assert!(!is_valid_segment_name(""));
    }

    #[test]
    fn test_rewrite_manifest_points_segments_at_gateway() {
        let rewritten = rewrite_manifest(MANIFEST, "nba/");
        let lines: Vec<&str> = rewritten.lines().collect();
        assert!(lines.contains(&"nba/seg_00007.ts"));
        assert!(lines.contains(&"nba/seg_00008.ts"));
        assert!(lines.contains(&"#EXT-X-DISCONTINUITY"));
        assert!(lines.contains(&"#EXT-X-MEDIA-SEQUENCE:7"));
    }

    #[test]
    fn test_rewrite_map_uri() {
        let manifest = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n#EXTINF:4,\nseg_1.m4s\n";
        let rewritten = rewrite_manifest(manifest, "ch");
        assert!(rewritten.contains("#EXT-X-MAP:URI=\"ch/init.mp4\",BYTERANGE=\"720@0\""));
        assert!(rewritten.contains("\nch/seg_1.m4s\n"));
    }

    #[test]
    fn test_manifest_segments() {
        assert_eq!(manifest_segments(MANIFEST), vec!["seg_00007.ts", "seg_00008.ts"]);
        assert!(manifest_has_segments(MANIFEST));
        assert!(!manifest_has_segments("#EXTM3U\n#EXT-X-TARGETDURATION:4\n"));
    }

    #[tokio::test]
    async fn test_prune_keeps_window_and_referenced() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(dir.path().join(format!("seg_{i:05}.ts")), b"x").unwrap();
        }
        std::fs::write(dir.path().join(INPUT_NAME), b"ffconcat version 1.0\n").unwrap();
        // an old segment still listed in the playlist must survive
        std::fs::write(
            dir.path().join(MANIFEST_NAME),
            "#EXTM3U\n#EXTINF:4,\nseg_00001.ts\n#EXTINF:4,\nseg_00009.ts\n",
        )
        .unwrap();

        let deleted = prune_segments(dir.path(), 4).await.unwrap();
        assert_eq!(deleted, 5);

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(SEGMENT_PREFIX))
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["seg_00001.ts", "seg_00006.ts", "seg_00007.ts", "seg_00008.ts", "seg_00009.ts"]
        );
        assert!(dir.path().join(INPUT_NAME).exists());
    }

    #[tokio::test]
    async fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_segments(&dir.path().join("gone"), 3).await.unwrap(), 0);
    }
}
