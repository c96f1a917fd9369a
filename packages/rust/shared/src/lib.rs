//! Shared types, error model, and configuration for toolpipe.
//!
//! This crate is the foundation depended on by all other toolpipe crates.
//! It provides:
//! - [`ToolpipeError`] — the unified error type
//! - Domain types ([`WorkItem`], [`TaskId`], [`StageSpec`], [`PipelineSpec`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AuditConfig, ConversionConfig, DefaultsConfig, RouteConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{BoxError, Result, ToolpipeError};
pub use types::{Metadata, PipelineSpec, StageSpec, TaskId, WorkItem};
