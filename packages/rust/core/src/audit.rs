//! Audit sinks that persist external tool results.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use toolpipe_shared::{Result, TaskId, ToolpipeError};
use toolpipe_storage::Storage;

/// Append-only destination for `(task_id, stage, result)` records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one stage result. Returning means the record is durable (or rejected).
    async fn record(&self, task_id: &TaskId, stage: &str, result: &Value) -> Result<()>;
}

/// What an external tool stage does when its sink rejects a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistencePolicy {
    /// Fail the stage; the result is not delivered downstream.
    #[default]
    Strict,
    /// Log a warning and deliver the result anyway.
    LogAndContinue,
}

impl PersistencePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::LogAndContinue
        }
    }
}

#[async_trait]
impl AuditSink for Storage {
    async fn record(&self, task_id: &TaskId, stage: &str, result: &Value) -> Result<()> {
        self.record_stage_result(task_id.as_str(), stage, result)
            .await
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// A record held by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub task_id: TaskId,
    pub stage: String,
    pub result: Value,
}

/// In-process sink, used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
    fail_with: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every record with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Records for one task, in arrival order.
    pub fn records_for(&self, task_id: &TaskId) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| &r.task_id == task_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record(&self, task_id: &TaskId, stage: &str, result: &Value) -> Result<()> {
        if let Some(message) = &self.fail_with {
            return Err(ToolpipeError::Storage(message.clone()));
        }
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(AuditRecord {
                task_id: task_id.clone(),
                stage: stage.to_string(),
                result: result.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        let t1 = TaskId::new("t1");
        sink.record(&t1, "a", &json!(1)).await.unwrap();
        sink.record(&TaskId::new("t2"), "b", &json!(2)).await.unwrap();
        sink.record(&t1, "c", &json!(3)).await.unwrap();

        let stages: Vec<String> = sink.records_for(&t1).into_iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn failing_sink_rejects() {
        let sink = MemorySink::failing("disk full");
        let err = sink
            .record(&TaskId::new("t"), "s", &json!(null))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn storage_sink_persists() {
        let path = std::env::temp_dir().join(format!("tp_sink_{}.db", uuid::Uuid::now_v7()));
        let storage = Storage::open(&path).await.expect("open");
        storage
            .record(&TaskId::new("t1"), "fetch", &json!({"balance": 1}))
            .await
            .expect("record");

        let rows = storage.stage_results("t1").await.expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stage_name, "fetch");
    }

    #[test]
    fn policy_from_flag() {
        assert_eq!(PersistencePolicy::from_strict(true), PersistencePolicy::Strict);
        assert_eq!(
            PersistencePolicy::from_strict(false),
            PersistencePolicy::LogAndContinue
        );
    }
}
