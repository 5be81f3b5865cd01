use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{ExecutionMode, RemoteSection};
use crate::relocator::{available_path, move_file, RecordingArtifact};
use crate::rendition::{DerivedRendition, PLAYLIST_NAME};

#[async_trait]
pub trait UploadExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemUploadExecutor;

#[async_trait]
impl UploadExecutor for SystemUploadExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

pub type PublishResult<T> = std::result::Result<T, PublishError>;

#[derive(Debug)]
pub enum PublishOutcome {
    /// Local mode, nothing uploaded and nothing deleted.
    Skipped,
    Uploaded {
        remote_canonical: String,
        remote_rendition: Option<String>,
    },
    Quarantined {
        canonical: PathBuf,
        rendition: Option<PathBuf>,
    },
}

/// Uploads finalized artifacts through the object-storage CLI. The canonical
/// upload is retried once with credentials reapplied; artifacts that still
/// cannot be uploaded are moved to the quarantine directory, never deleted.
pub struct RemotePublisher {
    mode: ExecutionMode,
    remote: RemoteSection,
    aws_cli: PathBuf,
    quarantine_root: PathBuf,
    retry_delay_ms: [u64; 2],
    executor: Arc<dyn UploadExecutor>,
}

impl fmt::Debug for RemotePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePublisher")
            .field("mode", &self.mode)
            .field("bucket", &self.remote.bucket)
            .field("region", &self.remote.region)
            .field("aws_cli", &self.aws_cli)
            .field("quarantine_root", &self.quarantine_root)
            .finish()
    }
}

impl RemotePublisher {
    pub fn new(
        mode: ExecutionMode,
        remote: RemoteSection,
        aws_cli: PathBuf,
        quarantine_root: PathBuf,
        executor: Option<Arc<dyn UploadExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemUploadExecutor));
        Self {
            mode,
            remote,
            aws_cli,
            quarantine_root,
            retry_delay_ms: [500, 1500],
            executor,
        }
    }

    pub fn with_retry_delay_ms(mut self, range: [u64; 2]) -> Self {
        self.retry_delay_ms = range;
        self
    }

    pub async fn publish(
        &self,
        artifact: &RecordingArtifact,
        rendition: Option<&DerivedRendition>,
        stream_id: &str,
    ) -> PublishResult<PublishOutcome> {
        if self.mode == ExecutionMode::Local {
            info!(stream = %stream_id, "local mode, artifacts remain on disk");
            return Ok(PublishOutcome::Skipped);
        }

        let prefix = format!("recordings/{}", stream_id);
        let remote_rendition = match rendition {
            Some(rendition) => self.upload_rendition(rendition, &prefix).await,
            None => None,
        };

        let canonical_key = format!("{}/{}", prefix, artifact.file_name());
        let remote_canonical = match self.upload_file(&artifact.path, &canonical_key).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    path = %artifact.path.display(),
                    error = %err,
                    "canonical upload failed, retrying once"
                );
                let delay = rand::thread_rng()
                    .gen_range(self.retry_delay_ms[0]..=self.retry_delay_ms[1]);
                sleep(Duration::from_millis(delay)).await;
                match self.upload_file(&artifact.path, &canonical_key).await {
                    Ok(remote) => remote,
                    Err(err) => {
                        warn!(
                            path = %artifact.path.display(),
                            error = %err,
                            "canonical upload failed twice, quarantining artifacts"
                        );
                        return self.quarantine(artifact, rendition, stream_id).await;
                    }
                }
            }
        };

        self.remove_local(artifact, rendition).await;
        info!(remote = %remote_canonical, "artifacts uploaded");
        Ok(PublishOutcome::Uploaded {
            remote_canonical,
            remote_rendition,
        })
    }

    /// Uploads every file under the rendition directory, manifest last so a
    /// readable remote playlist never references missing segments. Failures
    /// leave the canonical upload unaffected.
    async fn upload_rendition(&self, rendition: &DerivedRendition, prefix: &str) -> Option<String> {
        let mut files: Vec<PathBuf> = WalkDir::new(&rendition.directory)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect();
        files.sort();
        files.sort_by_key(|path| {
            path.file_name()
                .map(|name| name == PLAYLIST_NAME)
                .unwrap_or(false)
        });

        for file in &files {
            let relative = match file.strip_prefix(&rendition.directory) {
                Ok(relative) => relative,
                Err(_) => continue,
            };
            let key = format!("{}/hls/{}", prefix, relative.to_string_lossy());
            if let Err(err) = self.upload_file(file, &key).await {
                warn!(
                    path = %file.display(),
                    error = %err,
                    "rendition upload failed, continuing without remote rendition"
                );
                return None;
            }
        }
        Some(format!("s3://{}/{}/hls/", self.remote.bucket, prefix))
    }

    async fn upload_file(&self, local: &Path, key: &str) -> PublishResult<String> {
        let destination = format!("s3://{}/{}", self.remote.bucket, key);
        let mut command = Command::new(&self.aws_cli);
        let mut parts = vec![self.aws_cli.to_string_lossy().into_owned()];
        command.arg("s3");
        parts.push("s3".to_string());
        command.arg("cp");
        parts.push("cp".to_string());
        command.arg(local);
        parts.push(local.to_string_lossy().into_owned());
        command.arg(destination.as_str());
        parts.push(destination.clone());
        command.arg("--region");
        parts.push("--region".to_string());
        command.arg(self.remote.region.as_str());
        parts.push(self.remote.region.clone());
        if let Some(endpoint) = &self.remote.endpoint {
            command.arg("--endpoint-url");
            parts.push("--endpoint-url".to_string());
            command.arg(endpoint.as_str());
            parts.push(endpoint.clone());
        }
        if !self.remote.access_key_id.is_empty() {
            command.env("AWS_ACCESS_KEY_ID", &self.remote.access_key_id);
        }
        if !self.remote.secret_access_key.is_empty() {
            command.env("AWS_SECRET_ACCESS_KEY", &self.remote.secret_access_key);
        }
        let cmd_string = parts.join(" ");
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(|source| PublishError::Io {
                source,
                path: local.to_path_buf(),
            })?;
        if !output.status.success() {
            return Err(PublishError::CommandFailure {
                command: cmd_string,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(extract_remote_path(&output.stdout).unwrap_or(destination))
    }

    async fn quarantine(
        &self,
        artifact: &RecordingArtifact,
        rendition: Option<&DerivedRendition>,
        stream_id: &str,
    ) -> PublishResult<PublishOutcome> {
        let quarantine_dir = self.quarantine_root.join(stream_id);
        fs::create_dir_all(&quarantine_dir)
            .await
            .map_err(|source| PublishError::Io {
                source,
                path: quarantine_dir.clone(),
            })?;

        let canonical_target = available_path(&quarantine_dir, &artifact.file_name()).await;
        move_file(&artifact.path, &canonical_target)
            .await
            .map_err(|source| PublishError::Io {
                source,
                path: artifact.path.clone(),
            })?;

        let mut rendition_target = None;
        if let Some(rendition) = rendition {
            let target = available_path(&quarantine_dir, "hls").await;
            match move_dir(&rendition.directory, &target).await {
                Ok(()) => rendition_target = Some(target),
                Err(err) => warn!(
                    path = %rendition.directory.display(),
                    error = %err,
                    "failed to quarantine rendition directory"
                ),
            }
        }

        warn!(path = %canonical_target.display(), "artifacts quarantined after failed upload");
        Ok(PublishOutcome::Quarantined {
            canonical: canonical_target,
            rendition: rendition_target,
        })
    }

    async fn remove_local(&self, artifact: &RecordingArtifact, rendition: Option<&DerivedRendition>) {
        if let Err(err) = fs::remove_file(&artifact.path).await {
            warn!(
                path = %artifact.path.display(),
                error = %err,
                "failed to remove local canonical after upload"
            );
        }
        if let Some(rendition) = rendition {
            if let Err(err) = fs::remove_dir_all(&rendition.directory).await {
                warn!(
                    path = %rendition.directory.display(),
                    error = %err,
                    "failed to remove local rendition after upload"
                );
            }
        }
    }
}

async fn move_dir(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir(from, to).await?;
            fs::remove_dir_all(from).await?;
            Ok(())
        }
    }
}

async fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).into_iter().filter_map(Result::ok) {
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|_| io::Error::other("entry outside source directory"))?;
        let target = to.join(relative);
        if entry.path().is_dir() {
            fs::create_dir_all(&target).await?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(entry.path(), &target).await?;
        }
    }
    Ok(())
}

fn extract_remote_path(stdout: &[u8]) -> Option<String> {
    let output = String::from_utf8_lossy(stdout);
    let regex = Regex::new(r"to (s3://\S+)").ok()?;
    regex
        .captures(&output)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}
