use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;

use skyrec_core::{
    FinalizeReport, FinalizeRequest, Finalizer, FinalizerConfig, JournalEntry, JournalFilter,
    JournalStore, StreamMapping, StreamRegistry, StraySweeper, SweepSummary,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] skyrec_core::ConfigError),
    #[error("finalization error: {0}")]
    Finalize(#[from] skyrec_core::FinalizeError),
    #[error("registry error: {0}")]
    Registry(#[from] skyrec_core::RegistryError),
    #[error("sweep error: {0}")]
    Sweep(#[from] skyrec_core::SweepError),
    #[error("journal error: {0}")]
    Journal(#[from] skyrec_core::JournalError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "SkyRec finalization control interface", long_about = None)]
pub struct Cli {
    /// Path to skyrec.toml; built-in defaults apply when the file is absent
    #[arg(long, default_value = "configs/skyrec.toml")]
    pub config: PathBuf,
    /// Override for storage.root
    #[arg(long)]
    pub storage_root: Option<PathBuf>,
    /// Alternative path for the finalization journal database
    #[arg(long)]
    pub journal_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the finalization pipeline for a finished recording
    Finalize(FinalizeArgs),
    /// Show recent finalization journal entries
    History(HistoryArgs),
    /// List persisted stream identities
    Mappings,
    /// Run a manual stray sweep for a registered stream
    Sweep(SweepArgs),
    /// Journal maintenance
    #[command(subcommand)]
    Journal(JournalCommands),
    /// Run configuration and storage checks
    Health,
    /// Emit shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct FinalizeArgs {
    /// Raw capture file handed over by the media server
    pub raw_path: PathBuf,
    /// Stream name, including the application prefix (e.g. live/drone_stream)
    pub stream_name: String,
    /// Base filename reported by the media server; defaults to the file stem
    #[arg(long)]
    pub base_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Filter by stream identity
    #[arg(long)]
    pub stream_id: Option<String>,
    /// Maximum number of entries
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Stream name whose directory strays should be moved into
    pub stream_name: String,
}

#[derive(Subcommand, Debug)]
pub enum JournalCommands {
    /// Copy the journal database with the SQLite backup API
    Backup(JournalPathArgs),
    /// Export the journal as a gzipped SQL dump
    Export(JournalPathArgs),
}

#[derive(Args, Debug)]
pub struct JournalPathArgs {
    /// Destination path
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "skyrecctl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = Runtime::new()?;

    match &cli.command {
        Commands::Finalize(args) => {
            let report = runtime.block_on(context.finalize(args))?;
            render(&report, cli.format)?;
        }
        Commands::History(args) => {
            let history = context.history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Mappings => {
            let mappings = runtime.block_on(context.mappings())?;
            render(&mappings, cli.format)?;
        }
        Commands::Sweep(args) => {
            let summary = runtime.block_on(context.sweep(args))?;
            render(&summary, cli.format)?;
        }
        Commands::Journal(JournalCommands::Backup(args)) => {
            let result = context.journal_backup(args)?;
            render(&result, cli.format)?;
        }
        Commands::Journal(JournalCommands::Export(args)) => {
            let result = context.journal_export(args)?;
            render(&result, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => unreachable!("handled above"),
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: FinalizerConfig,
    config_path: Option<PathBuf>,
    storage_root: PathBuf,
    journal_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.exists().then(|| cli.config.clone());
        let mut config = FinalizerConfig::load(config_path.as_deref())?;
        if let Some(root) = &cli.storage_root {
            config.storage.root = root.to_string_lossy().to_string();
        }
        let storage_root = config.storage_root();
        let journal_db = cli
            .journal_db
            .clone()
            .unwrap_or_else(|| storage_root.join(skyrec_core::finalizer::JOURNAL_DB_NAME));
        Ok(Self {
            config,
            config_path,
            storage_root,
            journal_db,
        })
    }

    async fn finalize(&self, args: &FinalizeArgs) -> Result<FinalizeReport> {
        if !args.raw_path.exists() {
            return Err(AppError::MissingResource(format!(
                "raw capture not found: {}",
                args.raw_path.display()
            )));
        }
        let base_name = args.base_name.clone().unwrap_or_else(|| {
            args.raw_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let journal = JournalStore::new(&self.journal_db)?;
        let finalizer = Finalizer::new(self.config.clone())?.with_journal(journal);
        let request = FinalizeRequest::new(&args.raw_path, &args.stream_name, base_name);
        Ok(finalizer.finalize(&request).await?)
    }

    fn history(&self, args: &HistoryArgs) -> Result<HistoryList> {
        if !self.journal_db.exists() {
            return Err(AppError::MissingResource(format!(
                "journal database not found: {}",
                self.journal_db.display()
            )));
        }
        let store = JournalStore::builder()
            .path(&self.journal_db)
            .read_only(true)
            .build()?;
        let rows = store.list(&JournalFilter {
            stream_id: args.stream_id.clone(),
            limit: Some(args.limit),
        })?;
        Ok(HistoryList { rows })
    }

    async fn mappings(&self) -> Result<MappingList> {
        let registry = StreamRegistry::new(&self.storage_root);
        let rows = registry.list_mappings().await?;
        Ok(MappingList { rows })
    }

    async fn sweep(&self, args: &SweepArgs) -> Result<SweepSummary> {
        let registry = StreamRegistry::new(&self.storage_root);
        let mapping = registry
            .list_mappings()
            .await?
            .into_iter()
            .find(|mapping| mapping.stream_name == args.stream_name)
            .ok_or_else(|| {
                AppError::MissingResource(format!(
                    "no identity registered for {}",
                    args.stream_name
                ))
            })?;
        let stream_dir = self.storage_root.join(&mapping.stream_id);
        let sweeper = StraySweeper::new(&self.storage_root);
        Ok(sweeper.sweep(&args.stream_name, &stream_dir).await?)
    }

    fn journal_backup(&self, args: &JournalPathArgs) -> Result<MaintenanceResult> {
        self.require_journal()?;
        let store = JournalStore::new(&self.journal_db)?;
        store.backup_to(&args.output)?;
        Ok(MaintenanceResult {
            action: "backup".to_string(),
            path: args.output.clone(),
        })
    }

    fn journal_export(&self, args: &JournalPathArgs) -> Result<MaintenanceResult> {
        self.require_journal()?;
        let store = JournalStore::new(&self.journal_db)?;
        store.export_backup(&args.output)?;
        Ok(MaintenanceResult {
            action: "export".to_string(),
            path: args.output.clone(),
        })
    }

    fn require_journal(&self) -> Result<()> {
        if self.journal_db.exists() {
            Ok(())
        } else {
            Err(AppError::MissingResource(format!(
                "journal database not found: {}",
                self.journal_db.display()
            )))
        }
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        match &self.config_path {
            Some(path) => results.push(HealthEntry::ok("skyrec.toml", path.display().to_string())),
            None => results.push(HealthEntry::warn(
                "skyrec.toml",
                "not found, built-in defaults in use".to_string(),
            )),
        }
        match self.config.validate() {
            Ok(()) => results.push(HealthEntry::ok("configuration", "valid".to_string())),
            Err(err) => results.push(HealthEntry::error("configuration", err.to_string())),
        }
        results.push(self.check_directory("storage root", &self.storage_root));
        results.push(self.check_optional_file(
            "stream_mappings.txt",
            &self.storage_root.join(skyrec_core::MAPPINGS_FILE_NAME),
        ));
        results.push(self.check_database("journal.db", &self.journal_db));
        results.push(self.check_holding_dir(
            "failed_uploads",
            &self.storage_root.join(skyrec_core::finalizer::QUARANTINE_DIR_NAME),
        ));
        results.push(self.check_holding_dir(
            "unidentified",
            &self.storage_root.join(skyrec_core::UNIDENTIFIED_DIR_NAME),
        ));
        results
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, path.display().to_string()),
            Ok(_) => HealthEntry::error(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
        }
    }

    fn check_optional_file(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, path.display().to_string())
        } else {
            HealthEntry::warn(name, "not created yet".to_string())
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{} not found", path.display()));
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }

    fn check_holding_dir(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::read_dir(path) {
            Ok(entries) => {
                let count = entries.filter_map(std::result::Result::ok).count();
                if count == 0 {
                    HealthEntry::ok(name, "empty".to_string())
                } else {
                    HealthEntry::warn(name, format!("{count} entries awaiting recovery"))
                }
            }
            Err(_) => HealthEntry::ok(name, "not created yet".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub rows: Vec<JournalEntry>,
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no finalizations journaled".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let uploaded = if entry.uploaded { "uploaded" } else { "local" };
            let duration = entry
                .duration_s
                .map(|value| format!("{value:.1}s"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "#{id} {stream_id} | {size} bytes | dur={duration} | {uploaded} | report={report} ",
                id = entry.id,
                stream_id = entry.stream_id,
                size = entry.canonical_size,
                report = entry.report_status,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct MappingList {
    pub rows: Vec<StreamMapping>,
}

impl DisplayFallback for MappingList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no stream identities registered".to_string();
        }
        self.rows
            .iter()
            .map(|mapping| format!("{} -> {}", mapping.stream_name, mapping.stream_id))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct MaintenanceResult {
    pub action: String,
    pub path: PathBuf,
}

impl DisplayFallback for MaintenanceResult {
    fn display(&self) -> String {
        format!("journal {} written to {}", self.action, self.path.display())
    }
}

impl DisplayFallback for FinalizeReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!(
                "run {run} | {stream} -> {id}{degraded}",
                run = self.run_id,
                stream = self.stream_name,
                id = self.stream_id,
                degraded = if self.degraded { " (degraded)" } else { "" },
            ),
            format!(
                "canonical: {} ({} bytes, {})",
                self.canonical_path.display(),
                self.canonical_size,
                self.format
            ),
        ];
        match &self.rendition {
            Some(rendition) => lines.push(format!(
                "rendition: {} ({} segments)",
                rendition.manifest_path.display(),
                rendition.segment_count
            )),
            None => lines.push("rendition: omitted".to_string()),
        }
        let mut upload = format!("upload: {}", self.upload.status);
        if let Some(remote) = &self.upload.remote_canonical {
            upload.push_str(&format!(" -> {remote}"));
        }
        if let Some(quarantine) = &self.upload.quarantined_to {
            upload.push_str(&format!(" -> {}", quarantine.display()));
        }
        lines.push(upload);
        lines.push(format!(
            "report: {} | strays moved: {}",
            self.report_status, self.strays_moved
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for SweepSummary {
    fn display(&self) -> String {
        format!(
            "moved {} to stream dir, {} to unidentified",
            self.moved_to_stream.len(),
            self.moved_to_unidentified.len()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skyrec_core::JournalRecord;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/skyrec.toml", configs_dir.join("skyrec.toml")).unwrap();

        let storage_root = root.join("recordings");
        fs::create_dir_all(&storage_root).unwrap();
        fs::write(
            storage_root.join(skyrec_core::MAPPINGS_FILE_NAME),
            "live/drone_stream:live/drone_stream_20240101T000000\n",
        )
        .unwrap();
        fs::create_dir_all(storage_root.join("live/drone_stream_20240101T000000")).unwrap();

        let journal_db = storage_root.join("journal.db");
        let store = JournalStore::new(&journal_db)?;
        store.initialize()?;
        store.record(&JournalRecord {
            run_id: "test-run".to_string(),
            stream_name: "live/drone_stream".to_string(),
            stream_id: "live/drone_stream_20240101T000000".to_string(),
            canonical_path: "/data/clip.mp4".to_string(),
            canonical_size: 2048,
            sha256: None,
            duration_s: Some(12.0),
            rendition_manifest: None,
            rendition_segments: None,
            uploaded: false,
            remote_canonical: None,
            remote_rendition: None,
            report_status: "acked".to_string(),
            degraded: false,
            node_origin: Some("skyrec-primary".to_string()),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })?;

        let cli = Cli {
            config: configs_dir.join("skyrec.toml"),
            storage_root: Some(storage_root.clone()),
            journal_db: Some(journal_db),
            format: OutputFormat::Json,
            command: Commands::Health,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn health_check_has_no_errors_on_prepared_layout() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check();
        assert!(!report
            .iter()
            .any(|entry| matches!(entry.status, CheckStatus::Error)));
        let journal = report
            .iter()
            .find(|entry| entry.name == "journal.db")
            .unwrap();
        assert!(matches!(journal.status, CheckStatus::Ok));
    }

    #[test]
    fn history_lists_journaled_runs() {
        let (_temp, context) = prepare_test_context().unwrap();
        let history = context
            .history(&HistoryArgs {
                stream_id: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(history.rows.len(), 1);
        assert_eq!(history.rows[0].run_id, "test-run");
        assert_eq!(history.rows[0].report_status, "acked");
    }

    #[test]
    fn mappings_come_from_the_identity_store() {
        let (_temp, context) = prepare_test_context().unwrap();
        let runtime = Runtime::new().unwrap();
        let mappings = runtime.block_on(context.mappings()).unwrap();
        assert_eq!(mappings.rows.len(), 1);
        assert_eq!(mappings.rows[0].stream_name, "live/drone_stream");
    }

    #[test]
    fn manual_sweep_moves_strays_into_the_stream_dir() {
        let (_temp, context) = prepare_test_context().unwrap();
        fs::write(
            context.storage_root.join("drone_stream-orphan.flv"),
            b"orphan",
        )
        .unwrap();

        let runtime = Runtime::new().unwrap();
        let summary = runtime
            .block_on(context.sweep(&SweepArgs {
                stream_name: "live/drone_stream".to_string(),
            }))
            .unwrap();
        assert_eq!(summary.moved_to_stream.len(), 1);
        assert!(context
            .storage_root
            .join("live/drone_stream_20240101T000000")
            .join("drone_stream-orphan.flv")
            .exists());
    }

    #[test]
    fn sweep_without_identity_is_rejected() {
        let (_temp, context) = prepare_test_context().unwrap();
        let runtime = Runtime::new().unwrap();
        let err = runtime
            .block_on(context.sweep(&SweepArgs {
                stream_name: "live/unknown".to_string(),
            }))
            .unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));
    }
}
