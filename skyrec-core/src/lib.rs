pub mod config;
pub mod error;
pub mod finalizer;
pub mod journal;
pub mod publisher;
pub mod registry;
pub mod relocator;
pub mod rendition;
pub mod reporter;
mod sqlite;
pub mod sweeper;

pub use config::{
    load_finalizer_config, ExecutionMode, FinalizerConfig, RemoteSection, RenditionSection,
    ReportingSection, StorageSection, SystemSection, ToolsSection,
};
pub use error::{ConfigError, Result};
pub use finalizer::{
    FinalizeError, FinalizeReport, FinalizeRequest, FinalizeResult, Finalizer, RenditionSummary,
    StorageLayout, UploadStatus, UploadSummary,
};
pub use journal::{
    compute_sha256, JournalEntry, JournalError, JournalFilter, JournalRecord, JournalResult,
    JournalStore, JournalStoreBuilder,
};
pub use publisher::{
    PublishError, PublishOutcome, PublishResult, RemotePublisher, SystemUploadExecutor,
    UploadExecutor,
};
pub use registry::{
    stream_key, RegistryError, RegistryResult, StreamIdentity, StreamMapping, StreamRegistry,
    MAPPINGS_FILE_NAME,
};
pub use relocator::{
    ArtifactFormat, ArtifactRelocator, CommandExecutor, RecordingArtifact, RelocateError,
    RelocateResult, SystemCommandExecutor,
};
pub use rendition::{
    DerivedRendition, HlsManifest, HlsSegmentEntry, RenditionBuilder, RenditionError,
    RenditionHandle, RenditionOutcome, RenditionResult, RenditionStatus, PLAYLIST_NAME,
};
pub use reporter::{
    CompletionRecord, MetadataReporter, RecordingMetadata, ReportError, ReportOutcome,
    ReportResult,
};
pub use sweeper::{StraySweeper, SweepError, SweepResult, SweepSummary, UNIDENTIFIED_DIR_NAME};
