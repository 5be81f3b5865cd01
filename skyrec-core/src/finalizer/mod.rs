mod error;
mod types;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ExecutionMode, FinalizerConfig};
use crate::journal::{compute_sha256, JournalRecord, JournalStore};
use crate::publisher::{PublishOutcome, RemotePublisher, UploadExecutor};
use crate::registry::{RegistryError, StreamIdentity, StreamRegistry};
use crate::relocator::{ArtifactFormat, ArtifactRelocator, CommandExecutor, RecordingArtifact};
use crate::rendition::{DerivedRendition, RenditionBuilder, RenditionOutcome};
use crate::reporter::{CompletionRecord, MetadataReporter, RecordingMetadata, ReportOutcome};
use crate::sweeper::StraySweeper;

pub use error::{FinalizeError, FinalizeResult};
pub use types::{
    FinalizeReport, FinalizeRequest, RenditionSummary, StorageLayout, UploadStatus, UploadSummary,
    FAILURES_LOG_NAME, JOURNAL_DB_NAME, QUARANTINE_DIR_NAME, RENDITION_DIR_NAME,
};

/// Runs the whole finalization pipeline for one completed recording:
/// identity, relocation, rendition, publish, report, sweep.
pub struct Finalizer {
    config: Arc<FinalizerConfig>,
    mode: ExecutionMode,
    layout: StorageLayout,
    registry: StreamRegistry,
    relocator: ArtifactRelocator,
    builder: RenditionBuilder,
    publisher: RemotePublisher,
    reporter: MetadataReporter,
    sweeper: StraySweeper,
    journal: Option<JournalStore>,
}

impl Finalizer {
    pub fn new(config: FinalizerConfig) -> FinalizeResult<Self> {
        config.validate()?;
        let mode = config.mode()?;
        let root = config.storage_root();
        let layout = StorageLayout::new(&root);
        let registry = StreamRegistry::new(&root)
            .with_lock_timeout(Duration::from_millis(config.storage.lock_timeout_ms))
            .with_lock_poll(Duration::from_millis(config.storage.lock_poll_ms));
        let relocator = ArtifactRelocator::new(&config.tools.ffmpeg, &config.tools.ffprobe, None);
        let builder = RenditionBuilder::new(&config.tools.ffmpeg)
            .with_segment_seconds(config.rendition.segment_seconds)
            .with_poll_interval(Duration::from_secs(config.rendition.poll_interval_secs))
            .with_kill_grace(Duration::from_secs(config.rendition.kill_grace_secs));
        let publisher = RemotePublisher::new(
            mode,
            config.remote.clone(),
            (&config.tools.aws_cli).into(),
            layout.quarantine_root(),
            None,
        );
        let reporter = MetadataReporter::new(&config.reporting.api_base_url)?;
        let sweeper = StraySweeper::new(&root);
        Ok(Self {
            config: Arc::new(config),
            mode,
            layout,
            registry,
            relocator,
            builder,
            publisher,
            reporter,
            sweeper,
            journal: None,
        })
    }

    /// Substitute the subprocess seam used for conversion and probing.
    pub fn with_command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.relocator = ArtifactRelocator::new(
            &self.config.tools.ffmpeg,
            &self.config.tools.ffprobe,
            Some(executor),
        );
        self
    }

    /// Substitute the subprocess seam used for object-storage uploads.
    pub fn with_upload_executor(mut self, executor: Arc<dyn UploadExecutor>) -> Self {
        self.publisher = RemotePublisher::new(
            self.mode,
            self.config.remote.clone(),
            (&self.config.tools.aws_cli).into(),
            self.layout.quarantine_root(),
            Some(executor),
        );
        self
    }

    pub fn with_journal(mut self, journal: JournalStore) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub async fn finalize(&self, request: &FinalizeRequest) -> FinalizeResult<FinalizeReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            run = %run_id,
            stream = %request.stream_name,
            base = %request.base_name,
            path = %request.raw_path.display(),
            "finalization started"
        );

        if fs::metadata(&request.raw_path).await.is_err() {
            return Err(FinalizeError::MissingCapture {
                path: request.raw_path.clone(),
            });
        }

        let (identity, degraded) = self.resolve_identity(&request.stream_name).await?;
        let stream_dir = match self.registry.ensure_identity_dir(&identity).await {
            Ok(dir) => dir,
            Err(err) => {
                self.log_failure("identity", &err.to_string());
                return Err(err.into());
            }
        };

        let result = self
            .run_steps(request, &identity, &stream_dir, &run_id, degraded, started_at)
            .await;

        // Self-healing pass, even when a later step failed: any orphan left at
        // the root by a crashed run gets rehomed while we know the stream dir.
        let strays_moved = match self.sweeper.sweep(&request.stream_name, &stream_dir).await {
            Ok(summary) => summary.moved_count(),
            Err(err) => {
                warn!(run = %run_id, error = %err, "stray sweep failed");
                0
            }
        };

        match result {
            Ok(mut report) => {
                report.strays_moved = strays_moved;
                self.append_journal(&report);
                info!(
                    run = %run_id,
                    stream_id = %report.stream_id,
                    upload = %report.upload.status,
                    "finalization complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.log_failure("pipeline", &err.to_string());
                Err(err)
            }
        }
    }

    async fn resolve_identity(
        &self,
        stream_name: &str,
    ) -> FinalizeResult<(StreamIdentity, bool)> {
        match self.registry.resolve_or_create(stream_name).await {
            Ok(identity) => Ok((identity, false)),
            Err(err @ RegistryError::LockTimeout { .. })
            | Err(err @ RegistryError::StoreUnwritable { .. }) => {
                warn!(
                    stream = %stream_name,
                    error = %err,
                    "identity store unavailable, proceeding with unpersisted identity"
                );
                Ok((self.registry.fallback_identity(stream_name), true))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run_steps(
        &self,
        request: &FinalizeRequest,
        identity: &StreamIdentity,
        stream_dir: &Path,
        run_id: &str,
        degraded: bool,
        started_at: chrono::DateTime<Utc>,
    ) -> FinalizeResult<FinalizeReport> {
        let artifact = self.relocator.relocate(&request.raw_path, stream_dir).await?;

        let sha256 = match compute_sha256(&artifact.path).await {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(path = %artifact.path.display(), error = %err, "digest failed");
                None
            }
        };
        let duration_s = self.relocator.probe_duration(&artifact.path).await.ok();

        let rendition = self.build_rendition(&artifact, stream_dir).await;

        let mut local_canonical = artifact.path.clone();
        let mut local_rendition_dir = rendition.as_ref().map(|r| r.directory.clone());
        let upload = match self
            .publisher
            .publish(&artifact, rendition.as_ref(), &identity.stream_id)
            .await
        {
            Ok(PublishOutcome::Skipped) => UploadSummary::skipped(),
            Ok(PublishOutcome::Uploaded {
                remote_canonical,
                remote_rendition,
            }) => UploadSummary::uploaded(remote_canonical, remote_rendition),
            Ok(PublishOutcome::Quarantined {
                canonical,
                rendition: moved_rendition,
            }) => {
                local_canonical = canonical.clone();
                if let Some(moved) = &moved_rendition {
                    local_rendition_dir = Some(moved.clone());
                }
                UploadSummary::quarantined(canonical)
            }
            Err(err) => {
                warn!(
                    run = %run_id,
                    error = %err,
                    "publish step failed, artifacts left in place"
                );
                self.log_failure("publish", &err.to_string());
                UploadSummary::failed()
            }
        };

        let record = self.completion_record(
            request,
            identity,
            &artifact,
            &local_canonical,
            local_rendition_dir.as_deref(),
            &upload,
        );
        let report_status = match self.reporter.report(&record).await {
            ReportOutcome::Acked => "acked".to_string(),
            ReportOutcome::Failed { .. } => "failed".to_string(),
        };

        Ok(FinalizeReport {
            run_id: run_id.to_string(),
            stream_name: identity.stream_name.clone(),
            stream_id: identity.stream_id.clone(),
            degraded,
            canonical_path: local_canonical,
            canonical_size: artifact.size_bytes,
            format: artifact.format.to_string(),
            sha256,
            duration_s,
            rendition: rendition.map(|r| RenditionSummary {
                directory: r.directory,
                manifest_path: r.manifest_path,
                segment_count: r.segment_count,
            }),
            upload,
            report_status,
            strays_moved: 0,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn build_rendition(
        &self,
        artifact: &RecordingArtifact,
        stream_dir: &Path,
    ) -> Option<DerivedRendition> {
        if artifact.format != ArtifactFormat::Canonical {
            info!(
                path = %artifact.path.display(),
                "skipping rendition for unconverted legacy artifact"
            );
            return None;
        }
        let output_dir = stream_dir.join(RENDITION_DIR_NAME);
        let handle = match self.builder.begin(&artifact.path, &output_dir).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to start rendition build, continuing without it");
                return None;
            }
        };
        let max_wait = Duration::from_secs(self.config.rendition.max_wait_secs);
        match self.builder.await_completion(handle, max_wait).await {
            RenditionOutcome::Success(rendition) => {
                info!(
                    manifest = %rendition.manifest_path.display(),
                    segments = rendition.segment_count,
                    "rendition ready"
                );
                Some(rendition)
            }
            RenditionOutcome::Failed => {
                warn!("rendition build failed, continuing without it");
                None
            }
            RenditionOutcome::TimedOut => {
                warn!("rendition build timed out, continuing without it");
                None
            }
        }
    }

    fn completion_record(
        &self,
        request: &FinalizeRequest,
        identity: &StreamIdentity,
        artifact: &RecordingArtifact,
        local_canonical: &Path,
        local_rendition_dir: Option<&Path>,
        upload: &UploadSummary,
    ) -> CompletionRecord {
        let local_hls = local_rendition_dir
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_default();
        let s3_hls = upload.remote_rendition.clone().unwrap_or_default();
        CompletionRecord {
            stream_name: request.stream_name.clone(),
            local_mp4_path: local_canonical.to_string_lossy().to_string(),
            s3_mp4_path: upload.remote_canonical.clone().unwrap_or_default(),
            local_hls_path: local_hls.clone(),
            s3_hls_path: s3_hls.clone(),
            file_size: artifact.size_bytes,
            environment: self.mode.environment_label().to_string(),
            recording_metadata: RecordingMetadata {
                file_size: artifact.size_bytes,
                file_format: artifact.container(),
                stream_id: identity.stream_id.clone(),
                hls_local_path: local_hls,
                hls_s3_path: s3_hls,
            },
        }
    }

    /// Journal append is best effort; the run already succeeded.
    fn append_journal(&self, report: &FinalizeReport) {
        let Some(journal) = &self.journal else {
            return;
        };
        let record = JournalRecord {
            run_id: report.run_id.clone(),
            stream_name: report.stream_name.clone(),
            stream_id: report.stream_id.clone(),
            canonical_path: report.canonical_path.to_string_lossy().to_string(),
            canonical_size: report.canonical_size as i64,
            sha256: report.sha256.clone(),
            duration_s: report.duration_s,
            rendition_manifest: report
                .rendition
                .as_ref()
                .map(|r| r.manifest_path.to_string_lossy().to_string()),
            rendition_segments: report.rendition.as_ref().map(|r| r.segment_count as i64),
            uploaded: report.upload.status == UploadStatus::Uploaded,
            remote_canonical: report.upload.remote_canonical.clone(),
            remote_rendition: report.upload.remote_rendition.clone(),
            report_status: report.report_status.clone(),
            degraded: report.degraded,
            node_origin: Some(self.config.system.node_name.clone()),
            started_at: report.started_at,
            finished_at: report.finished_at,
        };
        if let Err(err) = journal.initialize().and_then(|()| journal.record(&record)) {
            warn!(run = %report.run_id, error = %err, "failed to journal finalization");
        }
    }

    /// Operator-visible trail for fatal failures, next to the recordings.
    fn log_failure(&self, stage: &str, detail: &str) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.failures_log())
        {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), stage, detail);
        }
    }
}
