//! libSQL storage for the toolpipe audit trail (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the results that
//! external tool stages produced, keyed by task id. Rows are append-only.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`]
//! - Inspection (`toolpipe audit`): read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, Row, params};
use serde::Serialize;
use toolpipe_shared::{Result, ToolpipeError};

/// One persisted stage result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    /// Insertion order within the database.
    pub id: i64,
    pub task_id: String,
    pub stage_name: String,
    /// The result value as the tool returned it.
    pub result: serde_json::Value,
    /// RFC 3339 timestamp.
    pub recorded_at: String,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> ToolpipeError {
    ToolpipeError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolpipeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ToolpipeError::Storage(format!(
                "audit database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ToolpipeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ToolpipeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage results
    // -----------------------------------------------------------------------

    /// Append the result of `stage_name` for `task_id`. Returns the new row id.
    pub async fn record_stage_result(
        &self,
        task_id: &str,
        stage_name: &str,
        result: &serde_json::Value,
    ) -> Result<i64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let result_json = serde_json::to_string(result).map_err(storage_err)?;

        self.conn
            .execute(
                "INSERT INTO stage_results (task_id, stage_name, result_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, stage_name, result_json.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let id = self.conn.last_insert_rowid();
        tracing::debug!(task_id, stage_name, id, "stage result recorded");
        Ok(id)
    }

    /// All results recorded for exactly `task_id`, in insertion order.
    pub async fn stage_results(&self, task_id: &str) -> Result<Vec<StageRecord>> {
        let rows = self
            .conn
            .query(
                "SELECT id, task_id, stage_name, result_json, recorded_at
                 FROM stage_results WHERE task_id = ?1 ORDER BY id",
                params![task_id],
            )
            .await
            .map_err(storage_err)?;

        collect_records(rows).await
    }

    /// Results for `task_prefix` itself and for every task id of the form
    /// `"{task_prefix}_…"`, in insertion order.
    ///
    /// Chained hops use exactly that shape (`"{task_id}_{pipeline}"`), but so
    /// does any unrelated task whose id happens to start with `"{task_prefix}_"`;
    /// the query cannot tell them apart.
    pub async fn stage_results_with_prefix(&self, task_prefix: &str) -> Result<Vec<StageRecord>> {
        let rows = self
            .conn
            .query(
                "SELECT id, task_id, stage_name, result_json, recorded_at
                 FROM stage_results
                 WHERE task_id = ?1 OR substr(task_id, 1, length(?1) + 1) = ?1 || '_'
                 ORDER BY id",
                params![task_prefix],
            )
            .await
            .map_err(storage_err)?;

        collect_records(rows).await
    }

    /// Total number of recorded stage results.
    pub async fn count_stage_results(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM stage_results", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }
}

async fn collect_records(mut rows: libsql::Rows) -> Result<Vec<StageRecord>> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await.map_err(storage_err)? {
        records.push(record_from_row(&row)?);
    }
    Ok(records)
}

fn record_from_row(row: &Row) -> Result<StageRecord> {
    let result_json = row.get::<String>(3).map_err(storage_err)?;
    Ok(StageRecord {
        id: row.get::<i64>(0).map_err(storage_err)?,
        task_id: row.get::<String>(1).map_err(storage_err)?,
        stage_name: row.get::<String>(2).map_err(storage_err)?,
        result: serde_json::from_str(&result_json).map_err(storage_err)?,
        recorded_at: row.get::<String>(4).map_err(storage_err)?,
    })
}
