use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

pub const PLAYLIST_NAME: &str = "playlist.m3u8";
pub const SEGMENT_TEMPLATE: &str = "segment_%03d.ts";

const CHILD_WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum RenditionError {
    #[error("failed to prepare rendition directory {path}: {source}")]
    OutputDir { source: io::Error, path: PathBuf },
    #[error("failed to spawn conversion ({command}): {source}")]
    Spawn { source: io::Error, command: String },
    #[error("unknown rendition status: {0}")]
    UnknownStatus(String),
}

pub type RenditionResult<T> = std::result::Result<T, RenditionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionStatus {
    Converting,
    Success,
    Failed,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Converting => "converting",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RenditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenditionStatus {
    type Err = RenditionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "converting" => Ok(Self::Converting),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(RenditionError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DerivedRendition {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_count: usize,
}

#[derive(Debug)]
pub enum RenditionOutcome {
    Success(DerivedRendition),
    Failed,
    TimedOut,
}

/// Running conversion. The spawned unit owns the child process and reports
/// through the shared status cell; the handle only observes and cancels.
pub struct RenditionHandle {
    status: Arc<Mutex<RenditionStatus>>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
    output_dir: PathBuf,
    manifest_path: PathBuf,
}

impl fmt::Debug for RenditionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenditionHandle")
            .field("output_dir", &self.output_dir)
            .field("manifest_path", &self.manifest_path)
            .finish()
    }
}

impl RenditionHandle {
    pub fn status(&self) -> RenditionStatus {
        *self.status.lock().unwrap()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }
}

/// Builds the segmented HLS rendition of a canonical artifact with ffmpeg.
#[derive(Debug, Clone)]
pub struct RenditionBuilder {
    ffmpeg: PathBuf,
    segment_seconds: u32,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl RenditionBuilder {
    pub fn new<P: Into<PathBuf>>(ffmpeg: P) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            segment_seconds: 10,
            poll_interval: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn with_segment_seconds(mut self, seconds: u32) -> Self {
        self.segment_seconds = seconds;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub async fn begin(
        &self,
        canonical_path: &Path,
        output_dir: &Path,
    ) -> RenditionResult<RenditionHandle> {
        fs::create_dir_all(output_dir)
            .await
            .map_err(|source| RenditionError::OutputDir {
                source,
                path: output_dir.to_path_buf(),
            })?;

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(canonical_path)
            .arg("-c:v")
            .arg("libx264")
            .arg("-c:a")
            .arg("aac")
            .arg("-hls_time")
            .arg(self.segment_seconds.to_string())
            .arg("-hls_playlist_type")
            .arg("vod")
            .arg("-hls_list_size")
            .arg("0")
            .arg("-hls_flags")
            .arg("independent_segments")
            .arg("-hls_segment_filename")
            .arg(output_dir.join(SEGMENT_TEMPLATE))
            .arg(output_dir.join(PLAYLIST_NAME));
        self.begin_command(command, output_dir)
    }

    fn begin_command(
        &self,
        mut command: Command,
        output_dir: &Path,
    ) -> RenditionResult<RenditionHandle> {
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let rendered = render_command(&command);
        let mut child = command.spawn().map_err(|source| RenditionError::Spawn {
            source,
            command: rendered,
        })?;

        let status = Arc::new(Mutex::new(RenditionStatus::Converting));
        let cancel = Arc::new(AtomicBool::new(false));
        let status_cell = Arc::clone(&status);
        let cancel_flag = Arc::clone(&cancel);
        let kill_grace = self.kill_grace;
        let task = tokio::spawn(async move {
            loop {
                if cancel_flag.load(Ordering::SeqCst) {
                    terminate_child(&mut child);
                    if timeout(kill_grace, child.wait()).await.is_err() {
                        warn!("conversion ignored terminate signal, killing it");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    *status_cell.lock().unwrap() = RenditionStatus::Failed;
                    return;
                }
                match timeout(CHILD_WAIT_SLICE, child.wait()).await {
                    Ok(Ok(exit)) if exit.success() => {
                        *status_cell.lock().unwrap() = RenditionStatus::Success;
                        return;
                    }
                    Ok(_) => {
                        *status_cell.lock().unwrap() = RenditionStatus::Failed;
                        return;
                    }
                    Err(_) => continue,
                }
            }
        });

        Ok(RenditionHandle {
            status,
            cancel,
            task,
            output_dir: output_dir.to_path_buf(),
            manifest_path: output_dir.join(PLAYLIST_NAME),
        })
    }

    /// Polls the status cell until the conversion settles or `max_wait`
    /// elapses. On timeout the unit is cancelled, forcefully if it does not
    /// stop within the kill grace period.
    pub async fn await_completion(
        &self,
        mut handle: RenditionHandle,
        max_wait: Duration,
    ) -> RenditionOutcome {
        let deadline = Instant::now() + max_wait;
        loop {
            match handle.status() {
                RenditionStatus::Success => {
                    let _ = (&mut handle.task).await;
                    return finish_success(handle).await;
                }
                RenditionStatus::Failed => {
                    let _ = (&mut handle.task).await;
                    return RenditionOutcome::Failed;
                }
                RenditionStatus::Converting => {
                    if Instant::now() >= deadline {
                        return self.cancel_and_reap(handle).await;
                    }
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn cancel_and_reap(&self, mut handle: RenditionHandle) -> RenditionOutcome {
        handle.cancel.store(true, Ordering::SeqCst);
        // Covers one wait slice to observe the flag, the terminate grace
        // period, and the forced kill that follows it.
        let reap_window = self.kill_grace + CHILD_WAIT_SLICE * 3;
        if timeout(reap_window, &mut handle.task).await.is_err() {
            warn!(
                dir = %handle.output_dir.display(),
                "conversion did not stop within grace period, aborting"
            );
            handle.task.abort();
        }
        info!(dir = %handle.output_dir.display(), "conversion timed out");
        RenditionOutcome::TimedOut
    }
}

/// Asks the conversion process to stop on its own terms so it can flush
/// partial output; the caller escalates to a kill if it does not.
#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}

async fn finish_success(handle: RenditionHandle) -> RenditionOutcome {
    let contents = match fs::read_to_string(&handle.manifest_path).await {
        Ok(contents) => contents,
        Err(err) => {
            warn!(
                path = %handle.manifest_path.display(),
                error = %err,
                "conversion finished but manifest is unreadable"
            );
            return RenditionOutcome::Failed;
        }
    };
    match HlsManifest::parse(&contents) {
        Ok(manifest) => RenditionOutcome::Success(DerivedRendition {
            directory: handle.output_dir,
            manifest_path: handle.manifest_path,
            segment_count: manifest.segments.len(),
        }),
        Err(reason) => {
            warn!(
                path = %handle.manifest_path.display(),
                reason = %reason,
                "manifest failed validation"
            );
            RenditionOutcome::Failed
        }
    }
}

fn render_command(command: &Command) -> String {
    let std_command = command.as_std();
    let mut parts = vec![std_command.get_program().to_string_lossy().to_string()];
    for arg in std_command.get_args() {
        parts.push(arg.to_string_lossy().to_string());
    }
    parts.join(" ")
}

#[derive(Debug, Clone)]
pub struct HlsManifest {
    pub version: u32,
    pub target_duration: f64,
    pub segments: Vec<HlsSegmentEntry>,
}

#[derive(Debug, Clone)]
pub struct HlsSegmentEntry {
    pub duration: f64,
    pub uri: String,
}

impl HlsManifest {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut version = 3u32;
        let mut target_duration = 0.0f64;
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(|line| line.trim()) {
            if line.starts_with("#EXT-X-VERSION:") {
                version = line[15..].parse().map_err(|_| "invalid EXT-X-VERSION")?;
            } else if line.starts_with("#EXT-X-TARGETDURATION:") {
                target_duration = line[22..]
                    .parse()
                    .map_err(|_| "invalid EXT-X-TARGETDURATION")?;
            } else if line.starts_with("#EXTINF:") {
                let value = line[8..]
                    .trim_end_matches(',')
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(value);
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(HlsSegmentEntry {
                    duration,
                    uri: line.to_string(),
                });
            }
        }
        if segments.is_empty() {
            return Err("playlist missing segments".into());
        }
        Ok(Self {
            version,
            target_duration,
            segments,
        })
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PLAYLIST: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:10\n\
        #EXT-X-MEDIA-SEQUENCE:0\n\
        #EXTINF:10.000000,\n\
        segment_000.ts\n\
        #EXTINF:4.200000,\n\
        segment_001.ts\n\
        #EXT-X-ENDLIST\n";

    #[test]
    fn manifest_parse_counts_segments() {
        let manifest = HlsManifest::parse(SAMPLE_PLAYLIST).expect("parse");
        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(manifest.segments[0].uri, "segment_000.ts");
        assert!((manifest.total_duration() - 14.2).abs() < 0.001);
    }

    #[test]
    fn manifest_parse_rejects_missing_header() {
        assert!(HlsManifest::parse("#EXTINF:10,\nsegment.ts\n").is_err());
    }

    #[test]
    fn manifest_parse_rejects_empty_playlist() {
        assert!(HlsManifest::parse("#EXTM3U\n#EXT-X-ENDLIST\n").is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RenditionStatus::Converting,
            RenditionStatus::Success,
            RenditionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RenditionStatus>().unwrap(), status);
        }
        assert!("done".parse::<RenditionStatus>().is_err());
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    }

    #[cfg(unix)]
    fn script_command(script: &Path) -> Command {
        let mut command = Command::new("sh");
        command.arg(script);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn completed_conversion_yields_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_dir = dir.path().join("hls");
        std::fs::create_dir_all(&output_dir).expect("output dir");
        let playlist = output_dir.join(PLAYLIST_NAME);
        let script = dir.path().join("fake_ffmpeg.sh");
        write_script(
            &script,
            &format!(
                "printf '#EXTM3U\\n#EXT-X-VERSION:3\\n#EXT-X-TARGETDURATION:10\\n#EXTINF:10.0,\\nsegment_000.ts\\n#EXT-X-ENDLIST\\n' > {}\n: > {}",
                playlist.display(),
                output_dir.join("segment_000.ts").display()
            ),
        );

        let builder =
            RenditionBuilder::new("ffmpeg").with_poll_interval(Duration::from_millis(50));
        let handle = builder
            .begin_command(script_command(&script), &output_dir)
            .expect("begin");
        let outcome = builder
            .await_completion(handle, Duration::from_secs(10))
            .await;

        match outcome {
            RenditionOutcome::Success(rendition) => {
                assert_eq!(rendition.segment_count, 1);
                assert_eq!(rendition.manifest_path, playlist);
                assert_eq!(rendition.directory, output_dir);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_conversion_reports_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_dir = dir.path().join("hls");
        std::fs::create_dir_all(&output_dir).expect("output dir");
        let script = dir.path().join("fake_ffmpeg.sh");
        write_script(&script, "exit 1");

        let builder =
            RenditionBuilder::new("ffmpeg").with_poll_interval(Duration::from_millis(50));
        let handle = builder
            .begin_command(script_command(&script), &output_dir)
            .expect("begin");
        let outcome = builder
            .await_completion(handle, Duration::from_secs(10))
            .await;
        assert!(matches!(outcome, RenditionOutcome::Failed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_exit_without_segments_reports_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_dir = dir.path().join("hls");
        std::fs::create_dir_all(&output_dir).expect("output dir");
        let playlist = output_dir.join(PLAYLIST_NAME);
        let script = dir.path().join("fake_ffmpeg.sh");
        write_script(
            &script,
            &format!("printf '#EXTM3U\\n#EXT-X-ENDLIST\\n' > {}", playlist.display()),
        );

        let builder =
            RenditionBuilder::new("ffmpeg").with_poll_interval(Duration::from_millis(50));
        let handle = builder
            .begin_command(script_command(&script), &output_dir)
            .expect("begin");
        let outcome = builder
            .await_completion(handle, Duration::from_secs(10))
            .await;
        assert!(matches!(outcome, RenditionOutcome::Failed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stuck_conversion_is_terminated_then_reaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output_dir = dir.path().join("hls");
        std::fs::create_dir_all(&output_dir).expect("output dir");
        let pid_file = dir.path().join("converter.pid");
        let marker = dir.path().join("terminated");
        let script = dir.path().join("fake_ffmpeg.sh");
        // Publishes its pid, records the terminate signal, and otherwise
        // hangs; `wait` keeps the trap responsive while sleeping.
        write_script(
            &script,
            &format!(
                "echo $$ > {pid}\n\
                 trap ': > {marker}; exit 0' TERM\n\
                 sleep 30 &\n\
                 wait $!",
                pid = pid_file.display(),
                marker = marker.display()
            ),
        );

        let builder = RenditionBuilder::new("ffmpeg")
            .with_poll_interval(Duration::from_millis(50))
            .with_kill_grace(Duration::from_secs(2));
        let handle = builder
            .begin_command(script_command(&script), &output_dir)
            .expect("begin");

        let started = std::time::Instant::now();
        let outcome = builder
            .await_completion(handle, Duration::from_millis(300))
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, RenditionOutcome::TimedOut));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(10));

        assert!(
            marker.exists(),
            "conversion process never saw the terminate signal"
        );

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert_eq!(
            unsafe { libc::kill(pid, 0) },
            -1,
            "conversion process is still alive after cancellation"
        );
    }
}
