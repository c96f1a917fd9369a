//! Registry of named pipelines, request routing, and sequential chaining.
//!
//! The coordinator is the error boundary: every entry point returns a
//! structured [`RunFailure`] instead of letting an error escape unlabelled.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use toolpipe_shared::{Metadata, RouteConfig, TaskId, ToolpipeError, WorkItem};

use crate::observer::{PipelineObserver, SilentObserver};
use crate::pipeline::Pipeline;

// ---------------------------------------------------------------------------
// Routing rules
// ---------------------------------------------------------------------------

/// Selects `pipeline` when any keyword occurs in the request (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pipeline: String,
    keywords: Vec<String>,
}

impl RouteRule {
    pub fn new<I, S>(pipeline: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            pipeline: pipeline.into(),
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// The first keyword found in `lowered_request`, if any.
    fn matched_keyword(&self, lowered_request: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|k| lowered_request.contains(k.as_str()))
            .map(String::as_str)
    }
}

impl From<&RouteConfig> for RouteRule {
    fn from(config: &RouteConfig) -> Self {
        Self::new(config.pipeline.clone(), &config.keywords)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Output of one pipeline traversal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    pub pipeline: String,
    pub task_id: TaskId,
    pub content: Value,
    pub metadata: Metadata,
}

impl PipelineRun {
    /// `{success: true, ...}` report for external callers.
    pub fn to_report(&self) -> Value {
        json!({
            "success": true,
            "pipeline": self.pipeline,
            "task_id": self.task_id,
            "result": self.content,
            "metadata": self.metadata,
        })
    }
}

/// Output of a sequential chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainRun {
    pub task_id: TaskId,
    /// Content produced by the last hop.
    pub final_content: Value,
    /// Per-hop results, in execution order.
    pub hops: Vec<PipelineRun>,
}

impl ChainRun {
    pub fn to_report(&self) -> Value {
        json!({
            "success": true,
            "task_id": self.task_id,
            "final_result": self.final_content,
            "pipeline_results": self.hops.iter().map(PipelineRun::to_report).collect::<Vec<_>>(),
        })
    }
}

/// A failed route or chain, labelled with the task and pipeline it belongs to.
#[derive(Debug, thiserror::Error)]
#[error("task {task_id} failed: {error}")]
pub struct RunFailure {
    pub task_id: TaskId,
    /// Pipeline that failed or could not be found. `None` when routing found nothing.
    pub pipeline: Option<String>,
    #[source]
    pub error: ToolpipeError,
}

impl RunFailure {
    fn new(task_id: TaskId, pipeline: Option<String>, error: ToolpipeError) -> Self {
        Self {
            task_id,
            pipeline,
            error,
        }
    }

    /// `{success: false, error, task_id, ...}` report for external callers.
    pub fn to_report(&self) -> Value {
        json!({
            "success": false,
            "task_id": self.task_id,
            "pipeline": self.pipeline,
            "kind": self.error.kind(),
            "stage": self.error.stage(),
            "error": self.error.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Holds named pipelines, routes requests to them, and chains them.
///
/// Registration is expected during setup; the registry tolerates late
/// additions behind a reader/writer lock. Independent runs share nothing
/// mutable besides that registry.
///
/// Every run observes the coordinator's own cancellation token. Once
/// [`Coordinator::cancel_all`] fires, that token stays cancelled and every
/// later run fails with `Cancelled`. To stop a single request, run it with a
/// token from [`Coordinator::child_token`] and cancel that instead.
pub struct Coordinator {
    pipelines: RwLock<Vec<(String, Arc<Pipeline>)>>,
    routes: Vec<RouteRule>,
    default_pipeline: Option<String>,
    observer: Arc<dyn PipelineObserver>,
    cancel: CancellationToken,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Empty coordinator with the built-in keyword routes and a silent observer.
    pub fn new() -> Self {
        let routes = toolpipe_shared::AppConfig::default()
            .routes
            .iter()
            .map(RouteRule::from)
            .collect();
        Self {
            pipelines: RwLock::new(Vec::new()),
            routes,
            default_pipeline: None,
            observer: Arc::new(SilentObserver),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the keyword routes. Earlier rules win.
    pub fn with_routes(mut self, routes: Vec<RouteRule>) -> Self {
        self.routes = routes;
        self
    }

    /// Pipeline used before falling back to the first registered one.
    pub fn with_default_pipeline(mut self, name: impl Into<String>) -> Self {
        self.default_pipeline = Some(name.into());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register `pipeline` under `name`. Re-registering a name replaces the
    /// pipeline but keeps its original position.
    ///
    /// The registry name wins: a pipeline built under another name is renamed,
    /// so observers, logs, and failures all report `name`.
    pub fn add_pipeline(&self, name: impl Into<String>, mut pipeline: Pipeline) {
        let name = name.into();
        if pipeline.name() != name {
            debug!(
                from = pipeline.name(),
                to = %name,
                "renaming pipeline to its registry name"
            );
            pipeline.rename(name.clone());
        }
        let pipeline = Arc::new(pipeline);
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match pipelines.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => {
                debug!(pipeline = %name, "replacing registered pipeline");
                entry.1 = pipeline;
            }
            None => {
                debug!(pipeline = %name, "registering pipeline");
                pipelines.push((name, pipeline));
            }
        }
    }

    /// Registered names in insertion order.
    pub fn pipeline_names(&self) -> Vec<String> {
        self.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Pipeline name → stage names in execution order.
    pub fn list_capabilities(&self) -> BTreeMap<String, Vec<String>> {
        self.read()
            .iter()
            .map(|(name, p)| (name.clone(), p.stage_names()))
            .collect()
    }

    /// Cancel every in-flight and future run on this coordinator. Irreversible.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// A token for one run: cancelling it stops only that run, while
    /// [`Coordinator::cancel_all`] still reaches it.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Choose the pipeline for `request`.
    ///
    /// Order: `preferred` if registered, then the first keyword route whose
    /// pipeline is registered, then the configured default, then the first
    /// registered pipeline.
    pub fn select_pipeline(
        &self,
        request: &str,
        preferred: Option<&str>,
    ) -> Result<String, ToolpipeError> {
        let pipelines = self.read();
        let registered = |name: &str| pipelines.iter().any(|(n, _)| n == name);

        if let Some(name) = preferred {
            if registered(name) {
                return Ok(name.to_string());
            }
            warn!(preferred = name, "preferred pipeline not registered, routing by keywords");
        }

        let lowered = request.to_lowercase();
        for route in &self.routes {
            if let Some(keyword) = route.matched_keyword(&lowered) {
                if registered(route.pipeline()) {
                    debug!(keyword, pipeline = route.pipeline(), "keyword route matched");
                    return Ok(route.pipeline().to_string());
                }
            }
        }

        if let Some(name) = self.default_pipeline.as_deref().filter(|n| registered(n)) {
            return Ok(name.to_string());
        }

        pipelines
            .first()
            .map(|(n, _)| n.clone())
            .ok_or(ToolpipeError::NoPipelineAvailable)
    }

    /// Route `request` to one pipeline and run it.
    ///
    /// The request is both the initial content and the user context.
    pub async fn route_and_execute(
        &self,
        request: &str,
        task_id: &TaskId,
        preferred: Option<&str>,
    ) -> Result<PipelineRun, RunFailure> {
        self.route_and_execute_with(request, task_id, preferred, &self.cancel)
            .await
    }

    /// [`Coordinator::route_and_execute`] under a caller-supplied token,
    /// usually one from [`Coordinator::child_token`].
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn route_and_execute_with(
        &self,
        request: &str,
        task_id: &TaskId,
        preferred: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, RunFailure> {
        let name = self
            .select_pipeline(request, preferred)
            .map_err(|e| RunFailure::new(task_id.clone(), None, e))?;

        info!(pipeline = %name, "routing request");
        let item = WorkItem::new(request, task_id.clone(), request);
        self.run_named(&name, item, cancel).await
    }

    /// Run `pipeline_names` in order, feeding each hop's content into the next.
    ///
    /// Every hop starts with fresh metadata, the original request as user
    /// context, and task id `"{task_id}_{pipeline}"`. The first failing or
    /// missing pipeline ends the chain; earlier hops are not undone.
    pub async fn execute_sequential<S: AsRef<str>>(
        &self,
        request: &str,
        task_id: &TaskId,
        pipeline_names: &[S],
    ) -> Result<ChainRun, RunFailure> {
        self.execute_sequential_with(request, task_id, pipeline_names, &self.cancel)
            .await
    }

    /// [`Coordinator::execute_sequential`] under a caller-supplied token.
    #[instrument(skip_all, fields(task_id = %task_id, hops = pipeline_names.len()))]
    pub async fn execute_sequential_with<S: AsRef<str>>(
        &self,
        request: &str,
        task_id: &TaskId,
        pipeline_names: &[S],
        cancel: &CancellationToken,
    ) -> Result<ChainRun, RunFailure> {
        let mut current = Value::String(request.to_string());
        let mut hops = Vec::with_capacity(pipeline_names.len());

        for (i, name) in pipeline_names.iter().enumerate() {
            let name = name.as_ref();
            info!(hop = i, pipeline = name, "running hop");

            let item = WorkItem::new(current, task_id.hop(name), request);
            let run = self.run_named(name, item, cancel).await.map_err(|failure| {
                warn!(hop = i, pipeline = name, error = %failure.error, "chain aborted");
                // A missing pipeline is reported against the chain's own task id.
                if matches!(failure.error, ToolpipeError::PipelineNotFound { .. }) {
                    RunFailure::new(task_id.clone(), failure.pipeline, failure.error)
                } else {
                    failure
                }
            })?;

            current = run.content.clone();
            hops.push(run);
        }

        info!("chain complete");
        Ok(ChainRun {
            task_id: task_id.clone(),
            final_content: current,
            hops,
        })
    }

    async fn run_named(
        &self,
        name: &str,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, RunFailure> {
        let task_id = item.task_id().clone();
        let Some(pipeline) = self.get(name) else {
            return Err(RunFailure::new(
                task_id,
                Some(name.to_string()),
                ToolpipeError::PipelineNotFound {
                    name: name.to_string(),
                },
            ));
        };

        match pipeline
            .execute(item, self.observer.as_ref(), cancel)
            .await
        {
            Ok(out) => {
                let task_id = out.task_id().clone();
                let (content, metadata) = out.into_parts();
                Ok(PipelineRun {
                    pipeline: name.to_string(),
                    task_id,
                    content,
                    metadata,
                })
            }
            Err(error) => Err(RunFailure::new(task_id, Some(name.to_string()), error)),
        }
    }

    fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| Arc::clone(p))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(String, Arc<Pipeline>)>> {
        self.pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::stage::FnStage;

    fn tagging(name: &'static str) -> Pipeline {
        Pipeline::new(name).pipe(FnStage::new(name, move |item: WorkItem| async move {
            Ok(item.mark("ran", name))
        }))
    }

    #[test]
    fn route_rule_lowercases_keywords() {
        let rule = RouteRule::new("p", ["TOKEN"]);
        assert_eq!(rule.matched_keyword("my token"), Some("token"));
        assert_eq!(rule.matched_keyword("nothing here"), None);
    }

    #[test]
    fn selection_order() {
        let c = Coordinator::new()
            .with_routes(vec![RouteRule::new("crypto_pipeline", ["token"])])
            .with_default_pipeline("fallback");
        c.add_pipeline("general", tagging("general"));
        c.add_pipeline("crypto_pipeline", tagging("crypto_pipeline"));

        assert_eq!(c.select_pipeline("TOKEN please", None).unwrap(), "crypto_pipeline");
        assert_eq!(
            c.select_pipeline("token", Some("general")).unwrap(),
            "general"
        );
        // Unregistered preference falls through to keywords.
        assert_eq!(
            c.select_pipeline("token", Some("nope")).unwrap(),
            "crypto_pipeline"
        );
        // Unregistered default falls through to first registered.
        assert_eq!(c.select_pipeline("weather", None).unwrap(), "general");

        c.add_pipeline("fallback", tagging("fallback"));
        assert_eq!(c.select_pipeline("weather", None).unwrap(), "fallback");
    }

    #[test]
    fn keyword_route_to_missing_pipeline_is_ignored() {
        let c = Coordinator::new();
        c.add_pipeline("general", tagging("general"));
        assert_eq!(c.select_pipeline("token", None).unwrap(), "general");
    }

    #[test]
    fn re_registration_keeps_position() {
        let c = Coordinator::new();
        c.add_pipeline("a", tagging("a"));
        c.add_pipeline("b", tagging("b"));
        c.add_pipeline("a", Pipeline::new("a2"));
        assert_eq!(c.pipeline_names(), vec!["a", "b"]);
        assert!(c.list_capabilities()["a"].is_empty());
    }

    #[tokio::test]
    async fn route_uses_request_as_content_and_context() {
        let c = Coordinator::new();
        c.add_pipeline(
            "echo",
            Pipeline::new("echo").pipe(FnStage::new("ctx", |item: WorkItem| async move {
                let ctx = item.user_context().to_string();
                Ok(item.mark("ctx", ctx))
            })),
        );

        let run = c
            .route_and_execute("hello", &TaskId::new("t"), None)
            .await
            .expect("run");
        assert_eq!(run.content, json!("hello"));
        assert_eq!(run.metadata["ctx"], json!("hello"));
        assert_eq!(run.task_id.as_str(), "t");
    }

    #[tokio::test]
    async fn failure_report_shape() {
        let c = Coordinator::new();
        let failure = c
            .route_and_execute("x", &TaskId::new("t7"), None)
            .await
            .unwrap_err();
        let report = failure.to_report();
        assert_eq!(report["success"], json!(false));
        assert_eq!(report["task_id"], json!("t7"));
        assert_eq!(report["kind"], json!("no_pipeline_available"));
    }

    #[tokio::test]
    async fn child_token_cancels_one_run_only() {
        let c = Coordinator::new();
        c.add_pipeline("a", tagging("a"));

        let one = c.child_token();
        one.cancel();
        let failure = c
            .route_and_execute_with("x", &TaskId::new("t1"), None, &one)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ToolpipeError::Cancelled { .. }));

        let run = c
            .route_and_execute("x", &TaskId::new("t2"), None)
            .await
            .expect("other runs unaffected");
        assert_eq!(run.metadata["ran"], json!("a"));

        let two = c.child_token();
        c.cancel_all();
        assert!(two.is_cancelled());
    }

    #[tokio::test]
    async fn registry_name_is_reported_everywhere() {
        let observer = Arc::new(RecordingObserver::new());
        let c = Coordinator::new().with_observer(observer.clone());
        c.add_pipeline(
            "alias",
            Pipeline::new("inner").pipe(FnStage::new("boom", |_item: WorkItem| async {
                Err::<WorkItem, toolpipe_shared::BoxError>("nope".into())
            })),
        );

        let failure = c
            .route_and_execute("x", &TaskId::new("t"), None)
            .await
            .unwrap_err();
        assert_eq!(failure.pipeline.as_deref(), Some("alias"));

        let events = observer.events();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.pipeline == "alias"));
    }

    #[tokio::test]
    async fn cancel_all_stops_runs() {
        let c = Coordinator::new();
        c.add_pipeline("a", tagging("a"));
        c.cancel_all();
        let failure = c
            .route_and_execute("x", &TaskId::new("t"), None)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ToolpipeError::Cancelled { .. }));
        assert_eq!(failure.pipeline.as_deref(), Some("a"));
    }
}
