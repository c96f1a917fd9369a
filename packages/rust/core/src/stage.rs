//! The stage trait: one pipeline step made of a gate and a transformation.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use toolpipe_shared::{BoxError, Result, ToolpipeError, WorkItem};

/// A single pipeline step.
///
/// `should_process` is a pure, cheap predicate over the item. `process` is the
/// only place a stage may perform I/O; it must derive a new item rather than
/// modify the one it is given, and must keep the task id.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Identifying name, used in metadata keys, logs, and capability listings.
    fn name(&self) -> &str;

    /// Whether this stage applies to `item`. Defaults to always.
    fn should_process(&self, _item: &WorkItem) -> bool {
        true
    }

    /// Transform `item`. Long-running work should stop when `cancel` fires.
    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<WorkItem>;
}

type ProcessFn = dyn Fn(WorkItem) -> BoxFuture<'static, std::result::Result<WorkItem, BoxError>>
    + Send
    + Sync;
type GateFn = dyn Fn(&WorkItem) -> bool + Send + Sync;

/// Ad-hoc stage built from closures, for user-defined steps that need no state of their own.
pub struct FnStage {
    name: String,
    gate: Option<Arc<GateFn>>,
    process: Arc<ProcessFn>,
}

impl FnStage {
    /// Build a stage whose `process` runs `f` on a clone of the incoming item.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<WorkItem, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            gate: None,
            process: Arc::new(move |item| f(item).boxed()),
        }
    }

    /// Gate the stage with `predicate`.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&WorkItem) -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(predicate));
        self
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_process(&self, item: &WorkItem) -> bool {
        self.gate.as_ref().is_none_or(|gate| gate(item))
    }

    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<WorkItem> {
        let task_id = item.task_id().clone();
        let fut = (self.process)(item.clone());

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolpipeError::Cancelled {
                    stage: self.name.clone(),
                    task_id,
                });
            }
            output = fut => output,
        };

        let output = output.map_err(|source| ToolpipeError::StageExecution {
            stage: self.name.clone(),
            task_id: task_id.clone(),
            source,
        })?;

        if output.task_id() != &task_id {
            return Err(ToolpipeError::StageExecution {
                stage: self.name.clone(),
                task_id,
                source: "stage output changed the task id".into(),
            });
        }
        Ok(output)
    }
}
