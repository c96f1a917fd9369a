//! Core domain types flowing through toolpipe pipelines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audit trail attached to a [`WorkItem`]. Keys are unique; order is irrelevant.
pub type Metadata = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Stable identifier correlating a work item across stages and chained pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an externally supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-sortable identifier (UUID v7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Derive the identifier used for one hop of a chained run:
    /// `"{task_id}_{pipeline}"`.
    pub fn hop(&self, pipeline: &str) -> Self {
        Self(format!("{}_{pipeline}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// The unit of data flowing through a pipeline.
///
/// A work item is immutable per hop: stages never modify the item they are
/// given, they derive a new one. None of the derivation methods touch the
/// task id, and only [`WorkItem::rescope`] replaces the user context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    content: Value,
    #[serde(default)]
    metadata: Metadata,
    task_id: TaskId,
    #[serde(default)]
    user_context: String,
}

impl WorkItem {
    /// Create the entry item for a pipeline traversal, with empty metadata.
    pub fn new(
        content: impl Into<Value>,
        task_id: TaskId,
        user_context: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
            task_id,
            user_context: user_context.into(),
        }
    }

    /// Seed the metadata at construction time.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn user_context(&self) -> &str {
        &self.user_context
    }

    /// Consume the item, returning its content.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Split the item into `(content, metadata)`.
    pub fn into_parts(self) -> (Value, Metadata) {
        (self.content, self.metadata)
    }

    /// Derive a new item carrying `content`; metadata, task id, and context are copied.
    pub fn derive(&self, content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            metadata: self.metadata.clone(),
            task_id: self.task_id.clone(),
            user_context: self.user_context.clone(),
        }
    }

    /// Add or overwrite a single metadata key.
    pub fn mark(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the user context. Only context-setting stages should call this.
    pub fn rescope(mut self, user_context: impl Into<String>) -> Self {
        self.user_context = user_context.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Declarative pipeline specs
// ---------------------------------------------------------------------------

/// One entry in a declarative stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageSpec {
    /// Delegate to the registered external capability `name`.
    Tool { name: String },
    /// Runtime-resolved conversion stage.
    Converter,
}

/// A named pipeline described as an ordered stage list (`[[pipelines]]` in config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}
