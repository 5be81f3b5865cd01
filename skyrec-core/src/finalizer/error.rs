use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::ConfigError;
use crate::journal::JournalError;
use crate::registry::RegistryError;
use crate::relocator::RelocateError;
use crate::rendition::RenditionError;
use crate::reporter::ReportError;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("identity resolution failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("artifact relocation failed: {0}")]
    Relocate(#[from] RelocateError),
    #[error("rendition build failed: {0}")]
    Rendition(#[from] RenditionError),
    #[error("metadata reporter unavailable: {0}")]
    Report(#[from] ReportError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("raw capture not found: {path}")]
    MissingCapture { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type FinalizeResult<T> = Result<T, FinalizeError>;
