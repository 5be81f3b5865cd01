use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::registry::stream_key;
use crate::relocator::{available_path, move_file};

pub const UNIDENTIFIED_DIR_NAME: &str = "unidentified";

const ARTIFACT_EXTENSIONS: [&str; 4] = ["flv", "mp4", "ts", "m3u8"];

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type SweepResult<T> = std::result::Result<T, SweepError>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    pub moved_to_stream: Vec<PathBuf>,
    pub moved_to_unidentified: Vec<PathBuf>,
}

impl SweepSummary {
    pub fn moved_count(&self) -> usize {
        self.moved_to_stream.len() + self.moved_to_unidentified.len()
    }
}

/// Self-healing pass over the storage root. Artifact files orphaned there by
/// crashes are reassigned to the current stream directory when their name
/// contains the stream key, otherwise to a shared holding directory.
#[derive(Debug, Clone)]
pub struct StraySweeper {
    storage_root: PathBuf,
}

impl StraySweeper {
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> Self {
        Self {
            storage_root: storage_root.into(),
        }
    }

    pub fn unidentified_dir(&self) -> PathBuf {
        self.storage_root.join(UNIDENTIFIED_DIR_NAME)
    }

    /// Scans only the root level, moves files, never deletes them.
    pub async fn sweep(&self, stream_name: &str, stream_dir: &Path) -> SweepResult<SweepSummary> {
        let mut summary = SweepSummary::default();
        let mut entries = match fs::read_dir(&self.storage_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(summary),
            Err(source) => {
                return Err(SweepError::Io {
                    source,
                    path: self.storage_root.clone(),
                })
            }
        };

        let key = stream_key(stream_name);
        while let Some(entry) =
            entries
                .next_entry()
                .await
                .map_err(|source| SweepError::Io {
                    source,
                    path: self.storage_root.clone(),
                })?
        {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_artifact(&name) {
                continue;
            }

            let to_stream = name.contains(key);
            let destination_dir = if to_stream {
                stream_dir.to_path_buf()
            } else {
                self.unidentified_dir()
            };
            match relocate_stray(&path, &destination_dir, &name).await {
                Ok(target) => {
                    info!(from = %path.display(), to = %target.display(), "reassigned stray file");
                    if to_stream {
                        summary.moved_to_stream.push(target);
                    } else {
                        summary.moved_to_unidentified.push(target);
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to move stray file")
                }
            }
        }
        Ok(summary)
    }
}

async fn relocate_stray(path: &Path, destination_dir: &Path, name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(destination_dir).await?;
    let target = available_path(destination_dir, name).await;
    move_file(path, &target).await?;
    Ok(target)
}

fn is_artifact(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    ARTIFACT_EXTENSIONS
        .iter()
        .any(|ext| lowered.ends_with(&format!(".{ext}")))
}
