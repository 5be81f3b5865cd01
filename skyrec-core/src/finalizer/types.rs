use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::MAPPINGS_FILE_NAME;

pub const QUARANTINE_DIR_NAME: &str = "failed_uploads";
pub const RENDITION_DIR_NAME: &str = "hls";
pub const FAILURES_LOG_NAME: &str = "finalize_failures.log";
pub const JOURNAL_DB_NAME: &str = "journal.db";

/// Trigger input handed over by the media server when a recording closes.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub raw_path: PathBuf,
    pub stream_name: String,
    pub base_name: String,
}

impl FinalizeRequest {
    pub fn new(
        raw_path: impl Into<PathBuf>,
        stream_name: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self {
            raw_path: raw_path.into(),
            stream_name: stream_name.into(),
            base_name: base_name.into(),
        }
    }
}

/// Derives every well-known path under the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(stream_id)
    }

    pub fn rendition_dir(&self, stream_id: &str) -> PathBuf {
        self.stream_dir(stream_id).join(RENDITION_DIR_NAME)
    }

    pub fn quarantine_root(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR_NAME)
    }

    pub fn mappings_path(&self) -> PathBuf {
        self.root.join(MAPPINGS_FILE_NAME)
    }

    pub fn failures_log(&self) -> PathBuf {
        self.root.join(FAILURES_LOG_NAME)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_DB_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Local mode, nothing uploaded and nothing deleted.
    Skipped,
    Uploaded,
    Quarantined,
    /// Upload and quarantine both failed; artifacts left where they were.
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Uploaded => "uploaded",
            Self::Quarantined => "quarantined",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub status: UploadStatus,
    pub remote_canonical: Option<String>,
    pub remote_rendition: Option<String>,
    pub quarantined_to: Option<PathBuf>,
}

impl UploadSummary {
    pub fn skipped() -> Self {
        Self {
            status: UploadStatus::Skipped,
            remote_canonical: None,
            remote_rendition: None,
            quarantined_to: None,
        }
    }

    pub fn uploaded(remote_canonical: String, remote_rendition: Option<String>) -> Self {
        Self {
            status: UploadStatus::Uploaded,
            remote_canonical: Some(remote_canonical),
            remote_rendition,
            quarantined_to: None,
        }
    }

    pub fn quarantined(path: PathBuf) -> Self {
        Self {
            status: UploadStatus::Quarantined,
            remote_canonical: None,
            remote_rendition: None,
            quarantined_to: Some(path),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: UploadStatus::Failed,
            remote_canonical: None,
            remote_rendition: None,
            quarantined_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenditionSummary {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_count: usize,
}

/// What one finalization run produced, returned to the caller and mirrored
/// into the journal.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub run_id: String,
    pub stream_name: String,
    pub stream_id: String,
    pub degraded: bool,
    pub canonical_path: PathBuf,
    pub canonical_size: u64,
    pub format: String,
    pub sha256: Option<String>,
    pub duration_s: Option<f64>,
    pub rendition: Option<RenditionSummary>,
    pub upload: UploadSummary,
    pub report_status: String,
    pub strays_moved: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
