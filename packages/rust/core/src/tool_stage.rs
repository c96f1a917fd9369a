//! Stage that delegates to a fixed external capability and records its result.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use toolpipe_shared::{Result, ToolpipeError, WorkItem};

use crate::audit::{AuditSink, PersistencePolicy};
use crate::capability::Capability;
use crate::stage::Stage;

/// Invokes one external capability with the item's content.
///
/// The result is handed to the audit sink before the stage returns, so a
/// subsequent read of the sink always sees it. Output metadata gains
/// `"{name}_processed": true`.
pub struct ExternalToolStage {
    capability: Capability,
    sink: Arc<dyn AuditSink>,
    policy: PersistencePolicy,
}

impl ExternalToolStage {
    pub fn new(capability: Capability, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            capability,
            sink,
            policy: PersistencePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PersistencePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn processed_key(&self) -> String {
        format!("{}_processed", self.capability.name())
    }
}

#[async_trait]
impl Stage for ExternalToolStage {
    fn name(&self) -> &str {
        self.capability.name()
    }

    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<WorkItem> {
        let stage = self.name();
        let task_id = item.task_id();

        let invoked = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolpipeError::Cancelled {
                    stage: stage.to_string(),
                    task_id: task_id.clone(),
                });
            }
            out = self.capability.invoke(item.content().clone()) => out,
        };

        let result = invoked.map_err(|source| ToolpipeError::StageExecution {
            stage: stage.to_string(),
            task_id: task_id.clone(),
            source,
        })?;

        let persisted = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolpipeError::Cancelled {
                    stage: stage.to_string(),
                    task_id: task_id.clone(),
                });
            }
            ack = self.sink.record(task_id, stage, &result) => ack,
        };

        match (persisted, self.policy) {
            (Ok(()), _) => debug!(%task_id, stage, "tool result persisted"),
            (Err(e), PersistencePolicy::Strict) => {
                return Err(ToolpipeError::Persistence {
                    stage: stage.to_string(),
                    task_id: task_id.clone(),
                    message: e.to_string(),
                });
            }
            (Err(e), PersistencePolicy::LogAndContinue) => {
                warn!(%task_id, stage, error = %e, "tool result not persisted, continuing");
            }
        }

        Ok(item.derive(result).mark(self.processed_key(), true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use serde_json::{Value, json};
    use toolpipe_shared::{BoxError, TaskId};

    fn item() -> WorkItem {
        WorkItem::new("0xabc", TaskId::new("task_001"), "ctx").mark("seed", 1)
    }

    #[tokio::test]
    async fn invokes_and_records() {
        let sink = Arc::new(MemorySink::new());
        let stage = ExternalToolStage::new(
            Capability::from_fn("fetch_crypto_data", |v| json!({"address": v, "balance": 1000})),
            sink.clone(),
        );

        let input = item();
        let out = stage
            .process(&input, &CancellationToken::new())
            .await
            .expect("process");

        assert_eq!(out.content()["balance"], json!(1000));
        assert_eq!(out.metadata()["fetch_crypto_data_processed"], json!(true));
        assert_eq!(out.metadata()["seed"], json!(1));
        assert_eq!(out.task_id(), input.task_id());
        assert_eq!(out.user_context(), "ctx");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "fetch_crypto_data");
        assert_eq!(records[0].result, *out.content());
    }

    #[tokio::test]
    async fn capability_failure_is_stage_error() {
        let sink = Arc::new(MemorySink::new());
        let stage = ExternalToolStage::new(
            Capability::new("fetch", |_| async { Err::<Value, BoxError>("503".into()) }),
            sink.clone(),
        );

        let err = stage
            .process(&item(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some("fetch"));
        assert_eq!(err.task_id().map(TaskId::as_str), Some("task_001"));
        assert_eq!(err.kind(), "stage_execution");
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn strict_persistence_failure_fails_stage() {
        let stage = ExternalToolStage::new(
            Capability::from_fn("fetch", |v| v),
            Arc::new(MemorySink::failing("db locked")),
        );
        let err = stage
            .process(&item(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolpipeError::Persistence { .. }));
        assert!(err.to_string().contains("db locked"));
    }

    #[tokio::test]
    async fn relaxed_persistence_failure_continues() {
        let stage = ExternalToolStage::new(
            Capability::from_fn("fetch", |_| json!("ok")),
            Arc::new(MemorySink::failing("db locked")),
        )
        .with_policy(PersistencePolicy::LogAndContinue);

        let out = stage
            .process(&item(), &CancellationToken::new())
            .await
            .expect("continues");
        assert_eq!(out.content(), &json!("ok"));
    }

    #[tokio::test]
    async fn cancellation_mid_invoke_records_nothing() {
        let sink = Arc::new(MemorySink::new());
        let stage = ExternalToolStage::new(
            Capability::new("slow_fetch", |v| async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok::<Value, BoxError>(v)
            }),
            sink.clone(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = stage.process(&item(), &cancel).await.unwrap_err();
        assert!(matches!(err, ToolpipeError::Cancelled { .. }));
        assert_eq!(err.stage(), Some("slow_fetch"));
        assert_eq!(err.kind(), "cancelled");
        assert!(sink.records().is_empty());
    }
}
