//! Sequential tool-execution pipelines with content-driven routing.
//!
//! A [`Pipeline`] runs [`Stage`]s in order over a [`WorkItem`](toolpipe_shared::WorkItem).
//! Stages either call a fixed external capability ([`ExternalToolStage`]) or
//! pick one at run time ([`DynamicConversionStage`]). A [`Coordinator`] routes
//! requests to named pipelines and chains them.

pub mod audit;
pub mod capability;
pub mod convert;
pub mod coordinator;
pub mod factory;
pub mod observer;
pub mod pipeline;
pub mod stage;
pub mod tool_stage;

pub use audit::{AuditRecord, AuditSink, MemorySink, PersistencePolicy};
pub use capability::{Capability, ToolRegistry};
pub use convert::{
    CapabilityQuery, CapabilityResolver, ConversionHeuristic, DynamicConversionStage, FnResolver,
    RegistryResolver,
};
pub use coordinator::{ChainRun, Coordinator, PipelineRun, RouteRule, RunFailure};
pub use factory::{CRYPTO_PIPELINE, FactoryContext, PipelineFactory};
pub use observer::{Checkpoint, ObservedEvent, PipelineObserver, RecordingObserver, SilentObserver};
pub use pipeline::Pipeline;
pub use stage::{FnStage, Stage};
pub use tokio_util::sync::CancellationToken;
pub use tool_stage::ExternalToolStage;
