use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to move {from} to {to}: {source}")]
    RelocateFailed {
        source: io::Error,
        from: PathBuf,
        to: PathBuf,
    },
}

pub type RelocateResult<T> = std::result::Result<T, RelocateError>;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Legacy,
    Canonical,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("flv") => Self::Legacy,
            _ => Self::Canonical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Canonical => "canonical",
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
}

impl RecordingArtifact {
    /// Container name taken from the on-disk extension, e.g. `mp4` or `flv`.
    pub fn container(&self) -> String {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Converts legacy captures to the canonical container and moves them into
/// the stream directory under a timestamped, collision-free name.
pub struct ArtifactRelocator {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for ArtifactRelocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactRelocator")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .finish()
    }
}

impl ArtifactRelocator {
    pub fn new<F, P>(ffmpeg: F, ffprobe: P, executor: Option<Arc<dyn CommandExecutor>>) -> Self
    where
        F: Into<PathBuf>,
        P: Into<PathBuf>,
    {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            executor,
        }
    }

    /// Places the raw capture under `target_dir`. Legacy captures are remuxed
    /// to mp4 first; if the remux fails the original file is moved unconverted
    /// so the recording is never lost. Canonical captures are moved as-is and
    /// a move failure is fatal.
    pub async fn relocate(
        &self,
        raw_path: &Path,
        target_dir: &Path,
    ) -> RelocateResult<RecordingArtifact> {
        match ArtifactFormat::from_path(raw_path) {
            ArtifactFormat::Legacy => self.convert_or_salvage(raw_path, target_dir).await,
            ArtifactFormat::Canonical => self.move_canonical(raw_path, target_dir).await,
        }
    }

    pub async fn probe_duration(&self, path: &Path) -> RelocateResult<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let mut command = Command::new(&self.ffprobe);
        for arg in &args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| RelocateError::Io {
                source,
                path: path.to_path_buf(),
            })?;
        if !output.status.success() {
            return Err(RelocateError::CommandFailure {
                command: format!("{} {}", self.ffprobe.display(), args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.trim().parse::<f64>().unwrap_or(0.0))
    }

    async fn convert_or_salvage(
        &self,
        raw_path: &Path,
        target_dir: &Path,
    ) -> RelocateResult<RecordingArtifact> {
        let target = unique_target(target_dir, "mp4").await;
        match self.transcode(raw_path, &target).await {
            Ok(()) => {
                if let Err(err) = fs::remove_file(raw_path).await {
                    warn!(
                        path = %raw_path.display(),
                        error = %err,
                        "failed to remove raw capture after conversion"
                    );
                }
                info!(from = %raw_path.display(), to = %target.display(), "converted legacy capture");
                artifact_from(&target, ArtifactFormat::Canonical).await
            }
            Err(err) => {
                warn!(
                    path = %raw_path.display(),
                    error = %err,
                    "conversion failed, moving raw capture unconverted"
                );
                let extension = raw_path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("flv");
                let fallback = unique_target(target_dir, extension).await;
                move_file(raw_path, &fallback)
                    .await
                    .map_err(|source| RelocateError::RelocateFailed {
                        source,
                        from: raw_path.to_path_buf(),
                        to: fallback.clone(),
                    })?;
                artifact_from(&fallback, ArtifactFormat::Legacy).await
            }
        }
    }

    async fn move_canonical(
        &self,
        raw_path: &Path,
        target_dir: &Path,
    ) -> RelocateResult<RecordingArtifact> {
        let extension = raw_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4");
        let target = unique_target(target_dir, extension).await;
        move_file(raw_path, &target)
            .await
            .map_err(|source| RelocateError::RelocateFailed {
                source,
                from: raw_path.to_path_buf(),
                to: target.clone(),
            })?;
        info!(from = %raw_path.display(), to = %target.display(), "relocated canonical capture");
        artifact_from(&target, ArtifactFormat::Canonical).await
    }

    async fn transcode(&self, input: &Path, target: &Path) -> RelocateResult<()> {
        let args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            target.to_string_lossy().to_string(),
        ];
        let mut command = Command::new(&self.ffmpeg);
        for arg in &args {
            command.arg(arg);
        }
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| RelocateError::Io {
                source,
                path: input.to_path_buf(),
            })?;
        let rendered = format!("{} {}", self.ffmpeg.display(), args.join(" "));
        if !output.status.success() {
            return Err(RelocateError::CommandFailure {
                command: rendered,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        if fs::metadata(target).await.is_err() {
            return Err(RelocateError::CommandFailure {
                command: rendered,
                status: output.status.code(),
                stderr: "converted file missing".to_string(),
            });
        }
        Ok(())
    }
}

/// Rename with a copy-and-remove fallback for cross-filesystem moves.
pub(crate) async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await?;
            Ok(())
        }
    }
}

/// First non-existing path for `file_name` inside `dir`, adding a numeric
/// suffix before the extension on collision.
pub(crate) async fn available_path(dir: &Path, file_name: &str) -> PathBuf {
    let mut candidate = dir.join(file_name);
    if fs::metadata(&candidate).await.is_err() {
        return candidate;
    }
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };
    let mut suffix = 1;
    loop {
        let name = match extension {
            Some(ext) => format!("{}_{}.{}", stem, suffix, ext),
            None => format!("{}_{}", stem, suffix),
        };
        candidate = dir.join(name);
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        suffix += 1;
    }
}

async fn unique_target(dir: &Path, extension: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let mut candidate = dir.join(format!("{}.{}", stamp, extension));
    let mut suffix = 1;
    while fs::metadata(&candidate).await.is_ok() {
        candidate = dir.join(format!("{}_{}.{}", stamp, suffix, extension));
        suffix += 1;
    }
    candidate
}

async fn artifact_from(path: &Path, format: ArtifactFormat) -> RelocateResult<RecordingArtifact> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|source| RelocateError::Io {
            source,
            path: path.to_path_buf(),
        })?;
    Ok(RecordingArtifact {
        path: path.to_path_buf(),
        format,
        size_bytes: metadata.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{ExitStatus, Output};

    fn success_status() -> ExitStatus {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitStatus::from_raw(0)
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            ExitStatus::from_raw(0)
        }
    }

    fn failure_status() -> ExitStatus {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            ExitStatus::from_raw(1)
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            ExitStatus::from_raw(1)
        }
    }

    struct FakeTranscodeExecutor {
        succeed: bool,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for FakeTranscodeExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            if self.succeed {
                let target = args.last().cloned().unwrap_or_default();
                std::fs::write(&target, b"converted")?;
                Ok(Output {
                    status: success_status(),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                })
            } else {
                Ok(Output {
                    status: failure_status(),
                    stdout: Vec::new(),
                    stderr: b"remux failed".to_vec(),
                })
            }
        }
    }

    struct StdoutExecutor {
        stdout: &'static str,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for StdoutExecutor {
        async fn run(&self, _command: &mut Command) -> std::io::Result<Output> {
            Ok(Output {
                status: success_status(),
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    #[test]
    fn format_detection_by_extension() {
        assert_eq!(
            ArtifactFormat::from_path(Path::new("capture.flv")),
            ArtifactFormat::Legacy
        );
        assert_eq!(
            ArtifactFormat::from_path(Path::new("capture.FLV")),
            ArtifactFormat::Legacy
        );
        assert_eq!(
            ArtifactFormat::from_path(Path::new("capture.mp4")),
            ArtifactFormat::Canonical
        );
        assert_eq!(
            ArtifactFormat::from_path(Path::new("capture")),
            ArtifactFormat::Canonical
        );
    }

    #[tokio::test]
    async fn legacy_capture_is_converted_and_original_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("capture.flv");
        std::fs::write(&raw, b"raw flv").expect("write raw");
        let target_dir = dir.path().join("stream");
        std::fs::create_dir_all(&target_dir).expect("target dir");

        let relocator = ArtifactRelocator::new(
            "ffmpeg",
            "ffprobe",
            Some(Arc::new(FakeTranscodeExecutor { succeed: true })),
        );
        let artifact = relocator
            .relocate(&raw, &target_dir)
            .await
            .expect("relocate");

        assert_eq!(artifact.format, ArtifactFormat::Canonical);
        assert_eq!(artifact.container(), "mp4");
        assert!(artifact.path.starts_with(&target_dir));
        assert!(artifact.path.exists());
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn failed_conversion_moves_raw_capture_unconverted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("capture.flv");
        std::fs::write(&raw, b"raw flv").expect("write raw");
        let target_dir = dir.path().join("stream");
        std::fs::create_dir_all(&target_dir).expect("target dir");

        let relocator = ArtifactRelocator::new(
            "ffmpeg",
            "ffprobe",
            Some(Arc::new(FakeTranscodeExecutor { succeed: false })),
        );
        let artifact = relocator
            .relocate(&raw, &target_dir)
            .await
            .expect("relocate");

        assert_eq!(artifact.format, ArtifactFormat::Legacy);
        assert_eq!(artifact.container(), "flv");
        assert_eq!(artifact.size_bytes, 7);
        assert!(artifact.path.exists());
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn canonical_capture_is_moved_without_conversion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let raw = dir.path().join("capture.mp4");
        std::fs::write(&raw, b"already mp4").expect("write raw");
        let target_dir = dir.path().join("stream");
        std::fs::create_dir_all(&target_dir).expect("target dir");

        let relocator = ArtifactRelocator::new("ffmpeg", "ffprobe", None);
        let artifact = relocator
            .relocate(&raw, &target_dir)
            .await
            .expect("relocate");

        assert_eq!(artifact.format, ArtifactFormat::Canonical);
        assert!(artifact.path.exists());
        assert!(!raw.exists());
        let name = artifact.file_name();
        assert!(name.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn repeated_relocations_do_not_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target_dir = dir.path().join("stream");
        std::fs::create_dir_all(&target_dir).expect("target dir");
        let relocator = ArtifactRelocator::new("ffmpeg", "ffprobe", None);

        for n in 0..2 {
            let raw = dir.path().join(format!("capture-{}.mp4", n));
            std::fs::write(&raw, b"clip").expect("write raw");
            relocator
                .relocate(&raw, &target_dir)
                .await
                .expect("relocate");
        }

        let placed = std::fs::read_dir(&target_dir).expect("read dir").count();
        assert_eq!(placed, 2);
    }

    #[tokio::test]
    async fn available_path_suffixes_on_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("clip.mp4"), b"one").expect("write");
        std::fs::write(dir.path().join("clip_1.mp4"), b"two").expect("write");

        let free = available_path(dir.path(), "clip.mp4").await;
        assert_eq!(free, dir.path().join("clip_2.mp4"));

        let untouched = available_path(dir.path(), "other.mp4").await;
        assert_eq!(untouched, dir.path().join("other.mp4"));
    }

    #[tokio::test]
    async fn probe_duration_parses_ffprobe_output() {
        let relocator = ArtifactRelocator::new(
            "ffmpeg",
            "ffprobe",
            Some(Arc::new(StdoutExecutor { stdout: "12.34\n" })),
        );
        let duration = relocator
            .probe_duration(Path::new("clip.mp4"))
            .await
            .expect("probe");
        assert!((duration - 12.34).abs() < f64::EPSILON);
    }
}
