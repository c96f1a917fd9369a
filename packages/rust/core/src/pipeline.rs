//! Ordered stage sequences: `stage | stage | stage`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use toolpipe_shared::{Result, ToolpipeError, WorkItem};

use crate::observer::{PipelineObserver, SilentObserver};
use crate::stage::Stage;

/// An ordered, append-only sequence of stages executed one at a time.
///
/// Stage N's input is stage N−1's output. A stage whose gate rejects the
/// current item is skipped and the item flows on unchanged. The first failure
/// aborts the run; there is no recovery at this layer.
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    stage_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            stage_timeout: None,
        }
    }

    /// Append a stage. Returns `self` for chaining.
    pub fn add_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already-shared stage.
    pub fn add_shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Alias for [`Pipeline::add_stage`], reads like `a | b | c`.
    pub fn pipe(self, stage: impl Stage + 'static) -> Self {
        self.add_stage(stage)
    }

    /// Bound each stage's `process` call by `timeout`.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Stage names in registration order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run with no observer and a fresh cancellation token.
    pub async fn run(&self, item: WorkItem) -> Result<WorkItem> {
        self.execute(item, &SilentObserver, &CancellationToken::new())
            .await
    }

    /// Run every stage in order against `item`.
    #[instrument(skip_all, fields(pipeline = %self.name, task_id = %item.task_id()))]
    pub async fn execute(
        &self,
        item: WorkItem,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> Result<WorkItem> {
        let start = Instant::now();
        let mut current = item;

        debug!(stages = self.stages.len(), "pipeline started");

        for stage in &self.stages {
            let stage_name = stage.name();
            let task_id = current.task_id().clone();

            if cancel.is_cancelled() {
                let err = ToolpipeError::Cancelled {
                    stage: stage_name.to_string(),
                    task_id: task_id.clone(),
                };
                observer.stage_failed(&self.name, stage_name, &task_id, &err);
                return Err(err);
            }

            if !stage.should_process(&current) {
                debug!(stage = stage_name, "skipping stage, conditions not met");
                observer.stage_skipped(&self.name, stage_name, &task_id);
                continue;
            }

            debug!(stage = stage_name, "processing stage");
            observer.stage_started(&self.name, stage_name, &task_id);
            let stage_start = Instant::now();

            match self.process_stage(stage.as_ref(), &current, cancel).await {
                Ok(next) => {
                    let elapsed = stage_start.elapsed();
                    debug!(
                        stage = stage_name,
                        elapsed_ms = elapsed.as_millis(),
                        "stage complete"
                    );
                    observer.stage_completed(&self.name, stage_name, &task_id, elapsed);
                    current = next;
                }
                Err(err) => {
                    warn!(stage = stage_name, error = %err, "stage failed, aborting pipeline");
                    observer.stage_failed(&self.name, stage_name, &task_id, &err);
                    return Err(err);
                }
            }
        }

        info!(
            elapsed_ms = start.elapsed().as_millis(),
            "pipeline complete"
        );
        Ok(current)
    }

    async fn process_stage(
        &self,
        stage: &dyn Stage,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<WorkItem> {
        let Some(timeout) = self.stage_timeout else {
            return stage.process(item, cancel).await;
        };

        match tokio::time::timeout(timeout, stage.process(item, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(ToolpipeError::Timeout {
                stage: stage.name().to_string(),
                task_id: item.task_id().clone(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}
