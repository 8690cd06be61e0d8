use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::url::SourceKind;

pub struct Database {
    conn: Connection,
}

/* ----------------------------- enums & models ----------------------------- */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "queued"            => JobStatus::Queued,
            "downloading"       => JobStatus::Downloading,
            "paused"            => JobStatus::Paused,
            "completed"         => JobStatus::Completed,
            _                   => JobStatus::Failed,       // Default fallback
        }
    }
}

/// One download attempt. Mutated only by the download manager while running;
/// stored here once it reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadJob {
    pub id: String,
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_local_path: Option<String>,
    /// Human label of the chosen rendition.
    pub format: String,
    pub source_url: String,
    pub source_kind: SourceKind,
    pub progress_percent: f32,
    /// Last raw output line (or the terminal message).
    pub progress_text: String,
    pub status: JobStatus,
    pub command_base: String,
    pub command_args: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        format: impl Into<String>,
        source_url: impl Into<String>,
        source_kind: SourceKind,
    ) -> Self {
        DownloadJob {
            id: id.into(),
            title: title.into(),
            thumbnail_url: None,
            thumbnail_local_path: None,
            format: format.into(),
            source_url: source_url.into(),
            source_kind,
            progress_percent: 0.0,
            progress_text: String::new(),
            status: JobStatus::Queued,
            command_base: String::new(),
            command_args: Vec::new(),
            completed_at: None,
        }
    }
}

/// A row of metadata-fetch history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataFetchRow {
    pub resource_key: String,
    pub url: String,
    pub title: String,
    pub source_kind: SourceKind,
    pub fetched_at: DateTime<Utc>,
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.filter(|s| !s.is_empty())
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn job_from_row(r: &Row<'_>) -> Result<DownloadJob> {
    let kind: String = r.get(6)?;
    let status: String = r.get(9)?;
    let args_json: String = r.get(11)?;
    let completed_at: Option<String> = r.get(12)?;
    Ok(DownloadJob {
        id: r.get(0)?,
        title: r.get(1)?,
        thumbnail_url: r.get(2)?,
        thumbnail_local_path: r.get(3)?,
        format: r.get(4)?,
        source_url: r.get(5)?,
        source_kind: SourceKind::from(kind),
        progress_percent: r.get::<_, f64>(7)? as f32,
        progress_text: r.get(8)?,
        status: JobStatus::from(status),
        command_base: r.get(10)?,
        command_args: serde_json::from_str(&args_json).unwrap_or_default(),
        completed_at: parse_ts(completed_at),
    })
}

const JOB_COLUMNS: &str = "id, title, thumbnail_url, thumbnail_local_path, format, source_url, source_kind,
        progress_percent, progress_text, status, command_base, command_args, completed_at";

/* -------------------------------- database -------------------------------- */
impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                rusqlite::Error::InvalidPath(parent.join(format!("(create failed: {e})")))
            })?;
        }
        let conn = Connection::open(db_path)?;
        let db = Database { conn };
        db.create_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database { conn: Connection::open_in_memory()? };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                thumbnail_url TEXT,
                thumbnail_local_path TEXT,
                format TEXT NOT NULL,
                source_url TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                progress_percent REAL NOT NULL DEFAULT 0,
                progress_text TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL CHECK (status IN ('queued','downloading','paused','completed','failed')),
                command_base TEXT NOT NULL,
                command_args TEXT NOT NULL,
                completed_at TEXT,
                recorded_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata_history (
                resource_key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /* ----------------------------- write helpers ----------------------------- */

    /// Insert a job, replacing any earlier record with the same id.
    pub fn insert_job(&self, job: &DownloadJob) -> Result<()> {
        let args_json = serde_json::to_string(&job.command_args)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO downloads (id, title, thumbnail_url, thumbnail_local_path, format, source_url,
                source_kind, progress_percent, progress_text, status, command_base, command_args, completed_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.title,
                job.thumbnail_url,
                job.thumbnail_local_path,
                job.format,
                job.source_url,
                job.source_kind.as_str(),
                job.progress_percent as f64,
                job.progress_text,
                job.status.as_str(),
                job.command_base,
                args_json,
                job.completed_at.as_ref().map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Hard-delete a job record by id.
    pub fn delete_job(&self, id: &str) -> Result<usize> {
        let n = self.conn.execute("DELETE FROM downloads WHERE id=?1", [id])?;
        Ok(n)
    }

    pub fn record_metadata_fetch(&self, row: &MetadataFetchRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata_history (resource_key, url, title, source_kind, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.resource_key,
                row.url,
                row.title,
                row.source_kind.as_str(),
                row.fetched_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_metadata_history(&self, resource_key: &str) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM metadata_history WHERE resource_key=?1", [resource_key])?;
        Ok(n)
    }

    /* ------------------------------ read helpers ----------------------------- */

    pub fn find_job(&self, id: &str) -> Result<Option<DownloadJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM downloads WHERE id=?1");
        self.conn.query_row(&sql, [id], job_from_row).optional()
    }

    /// All recorded jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<DownloadJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM downloads ORDER BY recorded_at DESC, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], job_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<DownloadJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM downloads WHERE status=?1 ORDER BY recorded_at DESC, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], job_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_metadata_history(&self) -> Result<Vec<MetadataFetchRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT resource_key, url, title, source_kind, fetched_at
               FROM metadata_history
              ORDER BY fetched_at DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            let kind: String = r.get(3)?;
            let fetched_at: String = r.get(4)?;
            Ok(MetadataFetchRow {
                resource_key: r.get(0)?,
                url: r.get(1)?,
                title: r.get(2)?,
                source_kind: SourceKind::from(kind),
                fetched_at: parse_ts(Some(fetched_at)).unwrap_or_else(Utc::now),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
