//! Pipeline checkpoints reported to an injectable observer.
//!
//! Pipelines also emit `tracing` events at the same checkpoints; observers
//! exist so callers (progress UIs, tests) can react without parsing logs.

use std::sync::Mutex;
use std::time::Duration;

use toolpipe_shared::{TaskId, ToolpipeError};

/// Receives one callback per stage checkpoint.
pub trait PipelineObserver: Send + Sync {
    /// A stage's gate passed and `process` is about to run.
    fn stage_started(&self, pipeline: &str, stage: &str, task_id: &TaskId);
    /// A stage's gate rejected the item; it passes through unchanged.
    fn stage_skipped(&self, pipeline: &str, stage: &str, task_id: &TaskId);
    /// A stage returned its output item.
    fn stage_completed(&self, pipeline: &str, stage: &str, task_id: &TaskId, elapsed: Duration);
    /// A stage failed; the pipeline aborts after this call.
    fn stage_failed(&self, pipeline: &str, stage: &str, task_id: &TaskId, error: &ToolpipeError);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn stage_started(&self, _pipeline: &str, _stage: &str, _task_id: &TaskId) {}
    fn stage_skipped(&self, _pipeline: &str, _stage: &str, _task_id: &TaskId) {}
    fn stage_completed(&self, _pipeline: &str, _stage: &str, _task_id: &TaskId, _: Duration) {}
    fn stage_failed(&self, _pipeline: &str, _stage: &str, _task_id: &TaskId, _: &ToolpipeError) {}
}

/// Checkpoint kinds captured by [`RecordingObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Started,
    Skipped,
    Completed,
    Failed,
}

/// One captured checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub checkpoint: Checkpoint,
    pub pipeline: String,
    pub stage: String,
    pub task_id: TaskId,
}

/// Observer that keeps every event in memory, in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// `(checkpoint, stage)` pairs, for compact assertions.
    pub fn trail(&self) -> Vec<(Checkpoint, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.checkpoint, e.stage))
            .collect()
    }

    fn push(&self, checkpoint: Checkpoint, pipeline: &str, stage: &str, task_id: &TaskId) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ObservedEvent {
                checkpoint,
                pipeline: pipeline.to_string(),
                stage: stage.to_string(),
                task_id: task_id.clone(),
            });
    }
}

impl PipelineObserver for RecordingObserver {
    fn stage_started(&self, pipeline: &str, stage: &str, task_id: &TaskId) {
        self.push(Checkpoint::Started, pipeline, stage, task_id);
    }

    fn stage_skipped(&self, pipeline: &str, stage: &str, task_id: &TaskId) {
        self.push(Checkpoint::Skipped, pipeline, stage, task_id);
    }

    fn stage_completed(&self, pipeline: &str, stage: &str, task_id: &TaskId, _elapsed: Duration) {
        self.push(Checkpoint::Completed, pipeline, stage, task_id);
    }

    fn stage_failed(&self, pipeline: &str, stage: &str, task_id: &TaskId, _error: &ToolpipeError) {
        self.push(Checkpoint::Failed, pipeline, stage, task_id);
    }
}
