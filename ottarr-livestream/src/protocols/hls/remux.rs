//! Continuous ffmpeg remux into a rolling HLS window.
//!
//! ffmpeg reads its source through an ffconcat input file instead of a
//! command-line URL, so the command line is identical for every run of a
//! channel. Switching sources rewrites that file atomically and restarts
//! ffmpeg against the same output directory; `append_list` and
//! `discont_start` keep the playlist continuous apart from one
//! discontinuity marker.

use async_trait::async_trait;
use ottarr_core::config::{DeliveryMode, RemuxConfig, StreamingConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::segments::{self, HlsLayout, INPUT_NAME, MANIFEST_NAME, SEGMENT_PATTERN};
use crate::error::{StreamError, StreamResult};
use crate::livestream::pipeline::{DeliveryHandle, DeliveryPipeline};
use crate::livestream::process::{ManagedProcess, ProcessSpec, Termination};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct RemuxSettings {
    pub ffmpeg_path: PathBuf,
    pub output_dir: PathBuf,
    pub segment_duration: u32,
    pub playlist_size: u32,
    pub max_segments: usize,
    pub termination_grace: Duration,
}

impl RemuxSettings {
    #[must_use]
    pub fn from_config(remux: &RemuxConfig, streaming: &StreamingConfig) -> Self {
        Self {
            ffmpeg_path: remux.ffmpeg_path.clone(),
            output_dir: remux.output_dir.clone(),
            segment_duration: remux.segment_duration_seconds,
            playlist_size: remux.playlist_size,
            max_segments: remux.max_segments,
            termination_grace: streaming.termination_grace(),
        }
    }
}

pub struct RemuxPipeline {
    settings: RemuxSettings,
    layout: HlsLayout,
}

impl RemuxPipeline {
    #[must_use]
    pub fn new(settings: RemuxSettings) -> Self {
        let layout = HlsLayout::new(settings.output_dir.clone());
        Self { settings, layout }
    }

    #[must_use]
    pub const fn layout(&self) -> &HlsLayout {
        &self.layout
    }

    /// Runs inside the channel directory; file arguments are relative so an
    /// escaped channel id never reaches ffmpeg's `%d` filename patterns.
    fn command(&self, channel_id: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.settings.ffmpeg_path);
        spec.args(["-hide_banner", "-nostdin", "-loglevel", "warning"])
            .args(["-fflags", "+genpts+discardcorrupt"])
            .args(["-f", "concat", "-safe", "0"])
            .args(["-protocol_whitelist", "file,http,https,tcp,tls,crypto"])
            .args(["-i", INPUT_NAME])
            .args(["-map", "0:v?", "-map", "0:a?", "-c", "copy"])
            .args(["-f", "hls"])
            .arg("-hls_time")
            .arg(self.settings.segment_duration.to_string())
            .arg("-hls_list_size")
            .arg(self.settings.playlist_size.to_string())
            .args([
                "-hls_flags",
                "delete_segments+append_list+discont_start+omit_endlist+temp_file",
            ])
            .args(["-hls_segment_filename", SEGMENT_PATTERN, MANIFEST_NAME]);
        spec.current_dir(self.layout.channel_dir(channel_id));
        spec
    }

    async fn launch(&self, channel_id: &str, source_url: &str) -> StreamResult<RemuxHandle> {
        let manifest = self.layout.manifest_path(channel_id);
        write_input_reference(&self.layout.input_path(channel_id), source_url).await?;

        // readiness means "the playlist changed since this run started"
        let baseline = tokio::fs::read_to_string(&manifest).await.ok();
        let process = ManagedProcess::spawn(&self.command(channel_id))?;

        info!(
            channel_id = %channel_id,
            source_url = %source_url,
            pid = ?process.pid(),
            "Remux process started"
        );
        Ok(RemuxHandle {
            process,
            manifest,
            baseline,
        })
    }
}

#[async_trait]
impl DeliveryPipeline for RemuxPipeline {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Remux
    }

    async fn start(
        &self,
        channel_id: &str,
        source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        let dir = self.layout.channel_dir(channel_id);
        // leftovers from a previous session must not count as fresh output
        remove_dir_if_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Box::new(self.launch(channel_id, source_url).await?))
    }

    async fn switch_source(
        &self,
        channel_id: &str,
        mut current: Box<dyn DeliveryHandle>,
        source_url: &str,
    ) -> StreamResult<Box<dyn DeliveryHandle>> {
        let outcome = current.terminate(self.settings.termination_grace).await?;
        debug!(channel_id = %channel_id, ?outcome, "Previous remux process stopped");
        tokio::fs::create_dir_all(self.layout.channel_dir(channel_id)).await?;
        Ok(Box::new(self.launch(channel_id, source_url).await?))
    }

    async fn maintain(&self, channel_id: &str) -> StreamResult<()> {
        segments::prune_segments(&self.layout.channel_dir(channel_id), self.settings.max_segments)
            .await?;
        Ok(())
    }

    async fn teardown(&self, channel_id: &str) -> StreamResult<()> {
        let dir = self.layout.channel_dir(channel_id);
        remove_dir_if_exists(&dir).await?;
        debug!(channel_id = %channel_id, dir = %dir.display(), "Remux output removed");
        Ok(())
    }
}

struct RemuxHandle {
    process: ManagedProcess,
    manifest: PathBuf,
    baseline: Option<String>,
}

#[async_trait]
impl DeliveryHandle for RemuxHandle {
    fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    async fn wait_ready(&mut self) -> StreamResult<()> {
        loop {
            if let Some(status) = self.process.try_exit()? {
                return Err(StreamError::ProcessDied(format!(
                    "ffmpeg exited with {status} before producing output"
                )));
            }
            if let Ok(current) = tokio::fs::read_to_string(&self.manifest).await {
                if segments::manifest_has_segments(&current)
                    && self.baseline.as_deref() != Some(current.as_str())
                {
                    return Ok(());
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn poll_exit(&mut self) -> StreamResult<Option<String>> {
        Ok(self
            .process
            .try_exit()?
            .map(|status| format!("ffmpeg exited with {status}")))
    }

    async fn terminate(&mut self, grace: Duration) -> StreamResult<Termination> {
        self.process.terminate(grace).await
    }
}

/// Atomically point the channel's ffconcat input at `source_url`.
pub async fn write_input_reference(path: &Path, source_url: &str) -> StreamResult<()> {
    let escaped = source_url.replace('\'', r"'\''");
    let content = format!("ffconcat version 1.0\nfile '{escaped}'\n");

    let tmp = path.with_extension("ffconcat.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> StreamResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(dir = %dir.display(), "Failed to remove directory: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Stands in for ffmpeg: writes one new segment plus a playlist to the
    /// last argument, then idles until signalled.
    const FAKE_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
dir=$(dirname "$last")
n=$(ls "$dir" | grep -c '^seg_')
printf 'x' > "$dir/seg_0000$n.ts"
printf '#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_0000%s.ts\n' "$n" > "$last"
exec sleep 30
"#;

    fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn settings(output: &Path, ffmpeg: PathBuf) -> RemuxSettings {
        RemuxSettings {
            ffmpeg_path: ffmpeg,
            output_dir: output.to_path_buf(),
            segment_duration: 4,
            playlist_size: 6,
            max_segments: 12,
            termination_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_input_reference_is_escaped_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.ffconcat");

        write_input_reference(&path, "http://a/x.ts").await.unwrap();
        write_input_reference(&path, "http://b/it's.ts").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "ffconcat version 1.0\nfile 'http://b/it'\\''s.ts'\n");
        assert!(!dir.path().join("input.ffconcat.tmp").exists());
    }

    #[test]
    fn test_command_line_is_source_independent() {
        let pipeline = RemuxPipeline::new(settings(Path::new("/srv/hls"), PathBuf::from("ffmpeg")));
        let spec = pipeline.command("nba");
        let args = spec.get_args();

        assert_eq!(spec.get_current_dir(), Some(Path::new("/srv/hls/nba")));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "input.ffconcat"));
        assert!(args.iter().any(|a| a.contains("append_list")));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-hls_segment_filename" && w[1] == "seg_%05d.ts"));
        assert_eq!(args.last().map(String::as_str), Some("index.m3u8"));
        assert!(!args.iter().any(|a| a.starts_with("http")));

        // escaped ids only show up in the working directory
        let spec = pipeline.command("50% off");
        assert_eq!(spec.get_current_dir(), Some(Path::new("/srv/hls/50%25%20off")));
        assert_eq!(spec.get_args(), args);
    }

    #[tokio::test]
    async fn test_start_switch_and_teardown_with_fake_ffmpeg() {
        let tools = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", FAKE_FFMPEG);
        let pipeline = RemuxPipeline::new(settings(output.path(), ffmpeg));
        let ready_timeout = Duration::from_secs(5);

        let mut handle = pipeline.start("nba", "http://a/x.ts").await.unwrap();
        tokio::time::timeout(ready_timeout, handle.wait_ready())
            .await
            .unwrap()
            .unwrap();
        let first_pid = handle.pid();
        assert!(first_pid.is_some());
        let input = pipeline.layout().input_path("nba");
        assert!(std::fs::read_to_string(&input).unwrap().contains("http://a/x.ts"));
        assert!(handle.poll_exit().unwrap().is_none());

        let mut handle = pipeline
            .switch_source("nba", handle, "http://b/y.ts")
            .await
            .unwrap();
        tokio::time::timeout(ready_timeout, handle.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(handle.pid(), first_pid);
        assert!(std::fs::read_to_string(&input).unwrap().contains("http://b/y.ts"));
        assert!(pipeline.layout().manifest_path("nba").exists());

        assert_eq!(
            handle.terminate(Duration::from_secs(2)).await.unwrap(),
            Termination::Graceful
        );
        pipeline.teardown("nba").await.unwrap();
        assert!(!pipeline.layout().channel_dir("nba").exists());
    }

    #[tokio::test]
    async fn test_process_exit_before_ready_is_reported() {
        let tools = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let ffmpeg = fake_tool(tools.path(), "ffmpeg", "#!/bin/sh\nexit 1\n");
        let pipeline = RemuxPipeline::new(settings(output.path(), ffmpeg));

        let mut handle = pipeline.start("nba", "http://a/x.ts").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait_ready())
            .await
            .unwrap();
        assert!(matches!(result, Err(StreamError::ProcessDied(_))));
    }
}
