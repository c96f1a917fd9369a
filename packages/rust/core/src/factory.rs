//! Builders for common pipeline shapes and for declarative stage lists.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use toolpipe_shared::{AppConfig, PipelineSpec, Result, StageSpec, ToolpipeError};

use crate::audit::{AuditSink, PersistencePolicy};
use crate::capability::ToolRegistry;
use crate::convert::{CapabilityResolver, ConversionHeuristic, DynamicConversionStage};
use crate::coordinator::{Coordinator, RouteRule};
use crate::pipeline::Pipeline;
use crate::tool_stage::ExternalToolStage;

/// Name of the built-in crypto pipeline.
pub const CRYPTO_PIPELINE: &str = "crypto_pipeline";

/// Everything a factory needs to turn stage specs into stages.
#[derive(Clone)]
pub struct FactoryContext {
    pub tools: ToolRegistry,
    pub resolver: Arc<dyn CapabilityResolver>,
    pub sink: Arc<dyn AuditSink>,
    pub heuristic: ConversionHeuristic,
    pub sample_len: usize,
    pub persistence: PersistencePolicy,
    pub stage_timeout: Option<Duration>,
}

impl FactoryContext {
    pub fn new(
        tools: ToolRegistry,
        resolver: Arc<dyn CapabilityResolver>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            tools,
            resolver,
            sink,
            heuristic: ConversionHeuristic::default(),
            sample_len: crate::convert::DEFAULT_SAMPLE_LEN,
            persistence: PersistencePolicy::default(),
            stage_timeout: None,
        }
    }

    /// Apply the conversion, audit, and timeout settings from `config`.
    pub fn configured(mut self, config: &AppConfig) -> Self {
        self.heuristic = ConversionHeuristic::from(&config.conversion);
        self.sample_len = config.conversion.sample_len;
        self.persistence = PersistencePolicy::from_strict(config.audit.strict);
        self.stage_timeout = config.defaults.stage_timeout_ms.map(Duration::from_millis);
        self
    }
}

/// Builds pipelines from stage lists.
pub struct PipelineFactory {
    ctx: FactoryContext,
}

impl PipelineFactory {
    pub fn new(ctx: FactoryContext) -> Self {
        Self { ctx }
    }

    /// `fetch_crypto_data | converter | format_crypto_output`.
    pub fn crypto_pipeline(&self) -> Result<Pipeline> {
        self.from_specs(
            CRYPTO_PIPELINE,
            &[
                StageSpec::Tool {
                    name: "fetch_crypto_data".into(),
                },
                StageSpec::Converter,
                StageSpec::Tool {
                    name: "format_crypto_output".into(),
                },
            ],
        )
    }

    /// Build a pipeline from a declarative spec.
    pub fn from_spec(&self, spec: &PipelineSpec) -> Result<Pipeline> {
        self.from_specs(&spec.name, &spec.stages)
    }

    /// Build a pipeline named `name` from `stages`, in order.
    ///
    /// Fails if a tool stage names a capability the registry does not hold.
    pub fn from_specs(&self, name: &str, stages: &[StageSpec]) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new(name);
        if let Some(timeout) = self.ctx.stage_timeout {
            pipeline = pipeline.with_stage_timeout(timeout);
        }

        for spec in stages {
            pipeline = match spec {
                StageSpec::Tool { name: tool } => {
                    let capability = self.ctx.tools.get(tool).ok_or_else(|| {
                        ToolpipeError::config(format!(
                            "pipeline '{name}' uses tool '{tool}', which is not registered"
                        ))
                    })?;
                    pipeline.pipe(
                        ExternalToolStage::new(capability.clone(), Arc::clone(&self.ctx.sink))
                            .with_policy(self.ctx.persistence),
                    )
                }
                StageSpec::Converter => pipeline.pipe(
                    DynamicConversionStage::with_heuristic(
                        Arc::clone(&self.ctx.resolver),
                        self.ctx.heuristic.clone(),
                    )
                    .with_sample_len(self.ctx.sample_len),
                ),
            };
        }

        Ok(pipeline)
    }

    /// Coordinator holding every `[[pipelines]]` entry of `config`, with its
    /// routes and default pipeline applied.
    ///
    /// When `config` declares no pipelines and the registry holds the crypto
    /// tools, the built-in crypto pipeline is registered instead.
    pub fn coordinator(&self, config: &AppConfig) -> Result<Coordinator> {
        let mut coordinator = Coordinator::new()
            .with_routes(config.routes.iter().map(RouteRule::from).collect());
        if let Some(name) = &config.defaults.default_pipeline {
            coordinator = coordinator.with_default_pipeline(name.clone());
        }

        if config.pipelines.is_empty() {
            if self.ctx.tools.contains("fetch_crypto_data")
                && self.ctx.tools.contains("format_crypto_output")
            {
                coordinator.add_pipeline(CRYPTO_PIPELINE, self.crypto_pipeline()?);
            }
        } else {
            for spec in &config.pipelines {
                coordinator.add_pipeline(spec.name.clone(), self.from_spec(spec)?);
            }
        }

        info!(
            pipelines = ?coordinator.pipeline_names(),
            "coordinator ready"
        );
        Ok(coordinator)
    }
}
