use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub const MAPPINGS_FILE_NAME: &str = "stream_mappings.txt";
pub const MAPPINGS_LOCK_NAME: &str = "stream_mappings.lock";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("timed out waiting for mappings lock {path}")]
    LockTimeout { path: PathBuf },
    #[error("mapping store unavailable at {path}: {source}")]
    StoreUnwritable { source: io::Error, path: PathBuf },
    #[error("failed to prepare stream directory {path}: {source}")]
    DirectoryCreateFailed { source: io::Error, path: PathBuf },
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Final path segment of a stream name: `live/drone_stream` -> `drone_stream`.
pub fn stream_key(stream_name: &str) -> &str {
    stream_name.rsplit('/').next().unwrap_or(stream_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub stream_name: String,
    pub stream_id: String,
    pub created: bool,
}

impl StreamIdentity {
    pub fn key(&self) -> &str {
        stream_key(&self.stream_name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMapping {
    pub stream_name: String,
    pub stream_id: String,
}

/// Append-only `streamName:streamId` store guarded by a lock file so that
/// concurrent finalizations of the same stream settle on one identity.
#[derive(Debug, Clone)]
pub struct StreamRegistry {
    storage_root: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl StreamRegistry {
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> Self {
        Self {
            storage_root: storage_root.into(),
            lock_timeout: Duration::from_millis(5000),
            lock_poll: Duration::from_millis(50),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll(mut self, poll: Duration) -> Self {
        self.lock_poll = poll;
        self
    }

    pub fn mappings_path(&self) -> PathBuf {
        self.storage_root.join(MAPPINGS_FILE_NAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.storage_root.join(MAPPINGS_LOCK_NAME)
    }

    /// Looks up the identity for `stream_name`, minting and appending a new
    /// one when absent. The lock is held only across this lookup-or-create.
    pub async fn resolve_or_create(&self, stream_name: &str) -> RegistryResult<StreamIdentity> {
        fs::create_dir_all(&self.storage_root)
            .await
            .map_err(|source| RegistryError::StoreUnwritable {
                source,
                path: self.storage_root.clone(),
            })?;
        let lock = self.acquire_lock().await?;
        let result = self.lookup_or_append(stream_name).await;
        lock.release().await;
        result
    }

    /// Identity minted without touching the store. Used when the store is
    /// unavailable; a later run of the same stream may get a different id.
    pub fn fallback_identity(&self, stream_name: &str) -> StreamIdentity {
        StreamIdentity {
            stream_name: stream_name.to_string(),
            stream_id: mint_stream_id(stream_name),
            created: true,
        }
    }

    pub async fn ensure_identity_dir(&self, identity: &StreamIdentity) -> RegistryResult<PathBuf> {
        let dir = self.storage_root.join(&identity.stream_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| RegistryError::DirectoryCreateFailed {
                source,
                path: dir.clone(),
            })?;
        let metadata =
            fs::metadata(&dir)
                .await
                .map_err(|source| RegistryError::DirectoryCreateFailed {
                    source,
                    path: dir.clone(),
                })?;
        if metadata.permissions().readonly() {
            return Err(RegistryError::DirectoryCreateFailed {
                source: io::Error::new(io::ErrorKind::PermissionDenied, "directory is read-only"),
                path: dir,
            });
        }
        Ok(dir)
    }

    pub async fn list_mappings(&self) -> RegistryResult<Vec<StreamMapping>> {
        let path = self.mappings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RegistryError::StoreUnwritable { source, path }),
        };
        Ok(parse_mappings(&content))
    }

    async fn acquire_lock(&self) -> RegistryResult<MappingsLock> {
        let path = self.lock_path();
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    return Ok(MappingsLock {
                        path,
                        released: false,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(RegistryError::LockTimeout { path });
                    }
                    sleep(self.lock_poll).await;
                }
                Err(source) => return Err(RegistryError::StoreUnwritable { source, path }),
            }
        }
    }

    async fn lookup_or_append(&self, stream_name: &str) -> RegistryResult<StreamIdentity> {
        let path = self.mappings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(RegistryError::StoreUnwritable { source, path }),
        };
        for mapping in parse_mappings(&content) {
            if mapping.stream_name == stream_name {
                debug!(stream = %stream_name, id = %mapping.stream_id, "reusing stream identity");
                return Ok(StreamIdentity {
                    stream_name: stream_name.to_string(),
                    stream_id: mapping.stream_id,
                    created: false,
                });
            }
        }

        let stream_id = mint_stream_id(stream_name);
        let line = format!("{}:{}\n", stream_name, stream_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| RegistryError::StoreUnwritable {
                source,
                path: path.clone(),
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| RegistryError::StoreUnwritable { source, path })?;
        info!(stream = %stream_name, id = %stream_id, "registered new stream identity");
        Ok(StreamIdentity {
            stream_name: stream_name.to_string(),
            stream_id,
            created: true,
        })
    }
}

fn mint_stream_id(stream_name: &str) -> String {
    format!("{}_{}", stream_name, Utc::now().format("%Y%m%dT%H%M%S"))
}

fn parse_mappings(content: &str) -> Vec<StreamMapping> {
    content
        .lines()
        .filter_map(|line| {
            line.trim().split_once(':').map(|(name, id)| StreamMapping {
                stream_name: name.to_string(),
                stream_id: id.to_string(),
            })
        })
        .collect()
}

#[derive(Debug)]
struct MappingsLock {
    path: PathBuf,
    released: bool,
}

impl MappingsLock {
    async fn release(mut self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %err, "failed to remove mappings lock");
        }
        self.released = true;
    }
}

impl Drop for MappingsLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
