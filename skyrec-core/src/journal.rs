use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use hex::encode as hex_encode;
use rusqlite::backup::Backup;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use crate::sqlite::configure_connection;

const JOURNAL_SCHEMA: &str = include_str!("../../sql/journal.sql");

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to open journal database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on journal database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("journal path not configured")]
    MissingStore,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type JournalResult<T> = Result<T, JournalError>;

/// One finalization run, written after the pipeline settles.
#[derive(Debug, Clone, Default)]
pub struct JournalRecord {
    pub run_id: String,
    pub stream_name: String,
    pub stream_id: String,
    pub canonical_path: String,
    pub canonical_size: i64,
    pub sha256: Option<String>,
    pub duration_s: Option<f64>,
    pub rendition_manifest: Option<String>,
    pub rendition_segments: Option<i64>,
    pub uploaded: bool,
    pub remote_canonical: Option<String>,
    pub remote_rendition: Option<String>,
    pub report_status: String,
    pub degraded: bool,
    pub node_origin: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: i64,
    pub run_id: String,
    pub stream_name: String,
    pub stream_id: String,
    pub canonical_path: String,
    pub canonical_size: i64,
    pub sha256: Option<String>,
    pub duration_s: Option<f64>,
    pub rendition_manifest: Option<String>,
    pub rendition_segments: Option<i64>,
    pub uploaded: bool,
    pub remote_canonical: Option<String>,
    pub remote_rendition: Option<String>,
    pub report_status: String,
    pub degraded: bool,
    pub node_origin: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            stream_name: row.get("stream_name")?,
            stream_id: row.get("stream_id")?,
            canonical_path: row.get("canonical_path")?,
            canonical_size: row.get("canonical_size")?,
            sha256: row.get("sha256")?,
            duration_s: row.get("duration_s")?,
            rendition_manifest: row.get("rendition_manifest")?,
            rendition_segments: row.get("rendition_segments")?,
            uploaded: row.get("uploaded")?,
            remote_canonical: row.get("remote_canonical")?,
            remote_rendition: row.get("remote_rendition")?,
            report_status: row.get("report_status")?,
            degraded: row.get("degraded")?,
            node_origin: row.get("node_origin")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            created_at: parse_timestamp(row.get("created_at")?)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct JournalFilter {
    pub stream_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct JournalStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for JournalStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl JournalStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> JournalResult<JournalStore> {
        let path = self.path.ok_or(JournalError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(JournalStore { path, flags })
    }
}

/// SQLite-backed history of finalization runs.
#[derive(Debug, Clone)]
pub struct JournalStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl JournalStore {
    pub fn builder() -> JournalStoreBuilder {
        JournalStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JournalResult<Self> {
        JournalStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> JournalResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            JournalError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| JournalError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> JournalResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        Ok(())
    }

    pub fn record(&self, record: &JournalRecord) -> JournalResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO finalization_journal (
                run_id, stream_name, stream_id, canonical_path, canonical_size,
                sha256, duration_s, rendition_manifest, rendition_segments,
                uploaded, remote_canonical, remote_rendition, report_status,
                degraded, node_origin, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                &record.run_id,
                &record.stream_name,
                &record.stream_id,
                &record.canonical_path,
                record.canonical_size,
                &record.sha256,
                &record.duration_s,
                &record.rendition_manifest,
                &record.rendition_segments,
                record.uploaded,
                &record.remote_canonical,
                &record.remote_rendition,
                &record.report_status,
                record.degraded,
                &record.node_origin,
                record.started_at,
                record.finished_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list(&self, filter: &JournalFilter) -> JournalResult<Vec<JournalEntry>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM finalization_journal");
        let mut params: Vec<Value> = Vec::new();
        if let Some(stream_id) = &filter.stream_id {
            query.push_str(" WHERE stream_id = ?");
            params.push(Value::Text(stream_id.clone()));
        }
        query.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(JournalEntry::from_row(row)?);
        }
        Ok(entries)
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> JournalResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        configure_connection(&dest).map_err(|source| JournalError::Open {
            source,
            path: destination_path.to_path_buf(),
        })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }

    pub fn export_backup(&self, output: impl AsRef<Path>) -> JournalResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut dump = String::new();
        dump.push_str(JOURNAL_SCHEMA);
        dump.push('\n');
        dump.push_str("BEGIN;\n");

        let mut stmt = conn.prepare(
            "SELECT run_id, stream_name, stream_id, canonical_path, canonical_size,
                    sha256, duration_s, rendition_manifest, rendition_segments,
                    uploaded, remote_canonical, remote_rendition, report_status,
                    degraded, node_origin
             FROM finalization_journal ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<i64>>(8)?,
                row.get::<_, bool>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, String>(12)?,
                row.get::<_, bool>(13)?,
                row.get::<_, Option<String>>(14)?,
            ))
        })?;

        for row in rows {
            let (
                run_id,
                stream_name,
                stream_id,
                canonical_path,
                canonical_size,
                sha256,
                duration_s,
                rendition_manifest,
                rendition_segments,
                uploaded,
                remote_canonical,
                remote_rendition,
                report_status,
                degraded,
                node_origin,
            ) = row?;
            dump.push_str(&format!(
                "INSERT INTO finalization_journal (run_id, stream_name, stream_id, canonical_path, canonical_size, sha256, duration_s, rendition_manifest, rendition_segments, uploaded, remote_canonical, remote_rendition, report_status, degraded, node_origin) VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {});\n",
                sql_quote(&run_id),
                sql_quote(&stream_name),
                sql_quote(&stream_id),
                sql_quote(&canonical_path),
                canonical_size,
                format_optional_text(sha256),
                format_optional_float(duration_s),
                format_optional_text(rendition_manifest),
                format_optional_integer(rendition_segments),
                uploaded as i64,
                format_optional_text(remote_canonical),
                format_optional_text(remote_rendition),
                sql_quote(&report_status),
                degraded as i64,
                format_optional_text(node_origin),
            ));
        }

        dump.push_str("COMMIT;\n");

        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(dump.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }
}

/// Hex digest of the artifact used for later integrity checks.
pub async fn compute_sha256(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex_encode(hasher.finalize()))
}

fn sql_quote(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

fn format_optional_integer(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

fn format_optional_float(value: Option<f64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "NULL".to_string())
}

fn format_optional_text(value: Option<String>) -> String {
    value
        .map(|v| sql_quote(&v))
        .unwrap_or_else(|| "NULL".to_string())
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    Ok(value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record(stream_id: &str) -> JournalRecord {
        JournalRecord {
            run_id: "4c2f9c2e-0000-0000-0000-000000000000".to_string(),
            stream_name: "live/drone_stream".to_string(),
            stream_id: stream_id.to_string(),
            canonical_path: "/data/live/drone_stream_x/20240101T000130.mp4".to_string(),
            canonical_size: 2048,
            sha256: Some("ab".repeat(32)),
            duration_s: Some(92.5),
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
        }
    }

    #[test]
    fn record_and_list_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path().join("journal.db")).expect("store");
        store.initialize().expect("initialize");

        store
            .record(&sample_record("live/drone_stream_a"))
            .expect("record a");
        store
            .record(&sample_record("live/drone_stream_b"))
            .expect("record b");

        let all = store.list(&JournalFilter::default()).expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].stream_id, "live/drone_stream_b");
        assert_eq!(all[0].canonical_size, 2048);
        assert_eq!(all[0].report_status, "acked");
        assert!(all[0].started_at.is_some());

        let filtered = store
            .list(&JournalFilter {
                stream_id: Some("live/drone_stream_a".to_string()),
                limit: Some(10),
            })
            .expect("filtered list");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].stream_id, "live/drone_stream_a");
    }

    #[test]
    fn backup_copies_all_entries() {
        let dir = tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path().join("journal.db")).expect("store");
        store.initialize().expect("initialize");
        store
            .record(&sample_record("live/drone_stream_a"))
            .expect("record");

        let backup_path = dir.path().join("backup.db");
        store.backup_to(&backup_path).expect("backup");

        let copy = JournalStore::new(&backup_path).expect("copy store");
        let entries = copy.list(&JournalFilter::default()).expect("list copy");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn export_produces_gzipped_dump() {
        let dir = tempdir().expect("tempdir");
        let store = JournalStore::new(dir.path().join("journal.db")).expect("store");
        store.initialize().expect("initialize");
        store
            .record(&sample_record("live/drone_stream_a"))
            .expect("record");

        let export_path = dir.path().join("exports/journal.sql.gz");
        store.export_backup(&export_path).expect("export");

        let compressed = std::fs::read(&export_path).expect("read export");
        assert!(compressed.starts_with(&[0x1f, 0x8b]));

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut dump = String::new();
        decoder.read_to_string(&mut dump).expect("decompress");
        assert!(dump.contains("CREATE TABLE IF NOT EXISTS finalization_journal"));
        assert!(dump.contains("live/drone_stream_a"));
    }

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"abc").expect("write");
        let digest = compute_sha256(&path).await.expect("digest");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
