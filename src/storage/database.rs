//! SQLite persistence for pipeline results

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::PipelineResult;

/// Acknowledgement returned by the persistence boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageReceipt {
    /// Persisted result id
    pub result_id: Uuid,
    /// Database row id
    pub row_id: i64,
    /// When the row was written
    pub stored_at: DateTime<Utc>,
}

/// Database connection wrapper.
///
/// rusqlite connections are not Sync; the pipeline calls in through
/// `spawn_blocking`, so a plain mutex around the connection is enough.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at path and ensure the schema exists
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        info!("opened results database at {:?}", path);
        Ok(db)
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                row_id       INTEGER PRIMARY KEY AUTOINCREMENT,
                result_id    TEXT NOT NULL UNIQUE,
                status       TEXT NOT NULL,
                frame_json   TEXT,
                blocks_json  TEXT NOT NULL,
                findings_json TEXT NOT NULL,
                errors_json  TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                stored_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_stored_at ON results(stored_at);
            "#,
        )?;
        Ok(())
    }

    /// Persist one pipeline result
    pub fn store(&self, result: &PipelineResult) -> Result<StorageReceipt, PipelineError> {
        let frame_json = result
            .frame
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let blocks_json = serde_json::to_string(&result.blocks)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let findings_json = serde_json::to_string(&result.findings)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let errors_json = serde_json::to_string(&result.errors)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let status = serde_json::to_string(&result.status)
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        let stored_at = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO results (result_id, status, frame_json, blocks_json, findings_json, errors_json, started_at, completed_at, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id.to_string(),
                status.trim_matches('"'),
                frame_json,
                blocks_json,
                findings_json,
                errors_json,
                result.started_at.to_rfc3339(),
                result.completed_at.to_rfc3339(),
                stored_at.to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::Storage(e.to_string()))?;

        Ok(StorageReceipt {
            result_id: result.id,
            row_id: conn.last_insert_rowid(),
            stored_at,
        })
    }

    /// Fetch a persisted result by id
    pub fn fetch(&self, id: Uuid) -> Result<Option<PipelineResult>, PipelineError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT status, frame_json, blocks_json, findings_json, errors_json, started_at, completed_at
                 FROM results WHERE result_id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        let Some((status, frame_json, blocks_json, findings_json, errors_json, started_at, completed_at)) =
            row
        else {
            return Ok(None);
        };

        let decode_err = |e: serde_json::Error| PipelineError::Storage(e.to_string());
        let parse_ts = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| PipelineError::Storage(e.to_string()))
        };

        Ok(Some(PipelineResult {
            id,
            status: serde_json::from_str(&format!("\"{}\"", status)).map_err(decode_err)?,
            frame: frame_json
                .map(|j| serde_json::from_str(&j))
                .transpose()
                .map_err(decode_err)?,
            blocks: serde_json::from_str(&blocks_json).map_err(decode_err)?,
            findings: serde_json::from_str(&findings_json).map_err(decode_err)?,
            errors: serde_json::from_str(&errors_json).map_err(decode_err)?,
            started_at: parse_ts(&started_at)?,
            completed_at: parse_ts(&completed_at)?,
        }))
    }

    /// Number of stored results
    pub fn count(&self) -> Result<u64, PipelineError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM results", [], |row| row.get::<_, u64>(0))
            .map_err(|e| PipelineError::Storage(e.to_string()))
    }
}
