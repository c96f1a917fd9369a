//! Runtime-resolved conversion stage.
//!
//! Some content needs a transformation that cannot be chosen when the pipeline
//! is built: a raw identifier where downstream stages expect a richer record,
//! say. [`DynamicConversionStage`] gates on a replaceable predicate, asks an
//! injected [`CapabilityResolver`] which capability fits the content, and runs
//! it. "No capability" is a pass-through; a failing resolver or capability is
//! an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use toolpipe_shared::{BoxError, ConversionConfig, Result, ToolpipeError, WorkItem};

use crate::capability::{Capability, ToolRegistry};
use crate::stage::Stage;

/// Name the conversion stage reports.
pub const CONVERTER_STAGE_NAME: &str = "converter";

/// Default number of characters sampled for a [`CapabilityQuery`].
pub const DEFAULT_SAMPLE_LEN: usize = 100;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// What the resolver is told about the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityQuery {
    /// Runtime type of the content: `string`, `object`, `array`, `number`, `bool`, or `null`.
    pub type_tag: String,
    /// First characters of the stringified content.
    pub sample: String,
}

impl CapabilityQuery {
    /// Describe `content`, sampling at most `sample_len` characters.
    pub fn describe(content: &Value, sample_len: usize) -> Self {
        let text = match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            type_tag: type_tag(content).to_string(),
            sample: text.chars().take(sample_len).collect(),
        }
    }
}

/// Runtime type tag of a JSON value.
pub fn type_tag(content: &Value) -> &'static str {
    match content {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Heuristic gate
// ---------------------------------------------------------------------------

/// Default "needs conversion" policy.
///
/// Matches strings of exactly `identifier_length` characters that start with
/// `identifier_prefix`, and objects with any key whose lowercase form contains
/// `key_fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionHeuristic {
    pub identifier_length: usize,
    pub identifier_prefix: String,
    pub key_fragment: String,
}

impl Default for ConversionHeuristic {
    fn default() -> Self {
        Self {
            identifier_length: 42,
            identifier_prefix: "0x".into(),
            key_fragment: "address".into(),
        }
    }
}

impl From<&ConversionConfig> for ConversionHeuristic {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            identifier_length: config.identifier_length,
            identifier_prefix: config.identifier_prefix.clone(),
            key_fragment: config.key_fragment.to_lowercase(),
        }
    }
}

impl ConversionHeuristic {
    pub fn matches(&self, content: &Value) -> bool {
        match content {
            Value::String(s) => {
                s.chars().count() == self.identifier_length
                    && s.starts_with(self.identifier_prefix.as_str())
            }
            Value::Object(map) => map
                .keys()
                .any(|k| k.to_lowercase().contains(self.key_fragment.as_str())),
            _ => false,
        }
    }
}

type Predicate = dyn Fn(&Value) -> bool + Send + Sync;

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Decides which capability, if any, converts content described by a query.
///
/// Implementations may be slow or fail; the stage treats them as opaque.
#[async_trait]
pub trait CapabilityResolver: Send + Sync {
    async fn resolve(
        &self,
        query: &CapabilityQuery,
        user_context: &str,
    ) -> std::result::Result<Option<Capability>, BoxError>;
}

type ResolveFn = dyn Fn(
        CapabilityQuery,
        String,
    ) -> BoxFuture<'static, std::result::Result<Option<Capability>, BoxError>>
    + Send
    + Sync;

/// Resolver backed by an async closure.
pub struct FnResolver {
    resolve: Arc<ResolveFn>,
}

impl FnResolver {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CapabilityQuery, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<Capability>, BoxError>> + Send + 'static,
    {
        Self {
            resolve: Arc::new(move |query, context| f(query, context).boxed()),
        }
    }
}

#[async_trait]
impl CapabilityResolver for FnResolver {
    async fn resolve(
        &self,
        query: &CapabilityQuery,
        user_context: &str,
    ) -> std::result::Result<Option<Capability>, BoxError> {
        (self.resolve)(query.clone(), user_context.to_string()).await
    }
}

/// Resolver that maps type tags to capabilities in a [`ToolRegistry`].
///
/// Unmapped tags resolve to `None`. A mapping to a name the registry lacks is
/// an error, since it means the configuration is wrong.
pub struct RegistryResolver {
    tools: ToolRegistry,
    by_type: BTreeMap<String, String>,
}

impl RegistryResolver {
    pub fn new(tools: ToolRegistry, by_type: BTreeMap<String, String>) -> Self {
        Self { tools, by_type }
    }
}

#[async_trait]
impl CapabilityResolver for RegistryResolver {
    async fn resolve(
        &self,
        query: &CapabilityQuery,
        _user_context: &str,
    ) -> std::result::Result<Option<Capability>, BoxError> {
        let Some(name) = self.by_type.get(&query.type_tag) else {
            return Ok(None);
        };
        match self.tools.get(name) {
            Some(capability) => Ok(Some(capability.clone())),
            None => Err(format!("converter '{name}' is not a registered tool").into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Stage whose transformation is chosen per item at run time.
pub struct DynamicConversionStage {
    resolver: Arc<dyn CapabilityResolver>,
    gate: Arc<Predicate>,
    sample_len: usize,
}

impl DynamicConversionStage {
    /// Conversion stage gated by [`ConversionHeuristic::default`].
    pub fn new(resolver: Arc<dyn CapabilityResolver>) -> Self {
        Self::with_heuristic(resolver, ConversionHeuristic::default())
    }

    pub fn with_heuristic(
        resolver: Arc<dyn CapabilityResolver>,
        heuristic: ConversionHeuristic,
    ) -> Self {
        Self {
            resolver,
            gate: Arc::new(move |content: &Value| heuristic.matches(content)),
            sample_len: DEFAULT_SAMPLE_LEN,
        }
    }

    /// Replace the gate. The predicate must be pure and must not panic.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.gate = Arc::new(predicate);
        self
    }

    pub fn with_sample_len(mut self, sample_len: usize) -> Self {
        self.sample_len = sample_len;
        self
    }

    fn conversion_error(&self, item: &WorkItem, source: BoxError) -> ToolpipeError {
        ToolpipeError::Conversion {
            stage: CONVERTER_STAGE_NAME.to_string(),
            task_id: item.task_id().clone(),
            source,
        }
    }

    fn cancelled(&self, item: &WorkItem) -> ToolpipeError {
        ToolpipeError::Cancelled {
            stage: CONVERTER_STAGE_NAME.to_string(),
            task_id: item.task_id().clone(),
        }
    }
}

#[async_trait]
impl Stage for DynamicConversionStage {
    fn name(&self) -> &str {
        CONVERTER_STAGE_NAME
    }

    fn should_process(&self, item: &WorkItem) -> bool {
        (self.gate)(item.content())
    }

    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Result<WorkItem> {
        let query = CapabilityQuery::describe(item.content(), self.sample_len);

        let resolved = tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancelled(item)),
            r = self.resolver.resolve(&query, item.user_context()) => r,
        };

        let Some(capability) = resolved.map_err(|e| self.conversion_error(item, e))? else {
            debug!(
                task_id = %item.task_id(),
                type_tag = %query.type_tag,
                "no converter resolved, passing through"
            );
            return Ok(item.clone());
        };

        let converted = tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancelled(item)),
            out = capability.invoke(item.content().clone()) => out,
        };
        let converted = converted.map_err(|e| self.conversion_error(item, e))?;

        debug!(
            task_id = %item.task_id(),
            converter = capability.name(),
            "content converted"
        );

        Ok(item
            .derive(converted)
            .mark("converted", true)
            .mark("converter", capability.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolpipe_shared::TaskId;

    const ADDRESS: &str = "0x1234567890abcdef1234567890abcdef12345678";

    fn item(content: Value) -> WorkItem {
        WorkItem::new(content, TaskId::new("t1"), "User wants crypto token information")
    }

    fn none_resolver() -> Arc<dyn CapabilityResolver> {
        Arc::new(FnResolver::new(|_, _| async { Ok(None) }))
    }

    #[test]
    fn heuristic_matches_identifier_shape() {
        let h = ConversionHeuristic::default();
        assert_eq!(ADDRESS.len(), 42);
        assert!(h.matches(&json!(ADDRESS)));
        assert!(!h.matches(&json!("0x1234")));
        // Right length, wrong prefix.
        assert!(!h.matches(&json!(format!("1x{}", &ADDRESS[2..]))));
    }

    #[test]
    fn heuristic_matches_address_keys_case_insensitively() {
        let h = ConversionHeuristic::default();
        assert!(h.matches(&json!({"walletAddress": "x"})));
        assert!(h.matches(&json!({"ADDRESS": 1})));
        assert!(!h.matches(&json!({"balance": 1})));
        assert!(!h.matches(&json!([ADDRESS])));
        assert!(!h.matches(&json!(42)));
    }

    #[test]
    fn query_describes_content() {
        let q = CapabilityQuery::describe(&json!(ADDRESS), 100);
        assert_eq!(q.type_tag, "string");
        assert_eq!(q.sample, ADDRESS);

        let q = CapabilityQuery::describe(&json!({"address": "0x1"}), 100);
        assert_eq!(q.type_tag, "object");
        assert_eq!(q.sample, r#"{"address":"0x1"}"#);

        let long = "é".repeat(150);
        let q = CapabilityQuery::describe(&json!(long), 100);
        assert_eq!(q.sample.chars().count(), 100);
    }

    #[test]
    fn predicate_is_replaceable() {
        let stage = DynamicConversionStage::new(none_resolver())
            .with_predicate(|content| content.as_i64() == Some(7));
        assert!(stage.should_process(&item(json!(7))));
        assert!(!stage.should_process(&item(json!(ADDRESS))));
    }

    #[tokio::test]
    async fn no_capability_is_pass_through() {
        let stage = DynamicConversionStage::new(none_resolver());
        let input = item(json!(ADDRESS)).mark("prior", true);
        let out = stage
            .process(&input, &CancellationToken::new())
            .await
            .expect("pass through");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn resolved_capability_converts() {
        let resolver = FnResolver::new(|query, context| async move {
            assert_eq!(query.type_tag, "string");
            assert!(context.contains("crypto"));
            Ok(Some(Capability::from_fn("address_to_symbol", |v| {
                json!({"address": v, "symbol": "ETH"})
            })))
        });
        let stage = DynamicConversionStage::new(Arc::new(resolver));

        let out = stage
            .process(&item(json!(ADDRESS)), &CancellationToken::new())
            .await
            .expect("convert");
        assert_eq!(out.content()["symbol"], json!("ETH"));
        assert_eq!(out.metadata()["converted"], json!(true));
        assert_eq!(out.metadata()["converter"], json!("address_to_symbol"));
        assert_eq!(out.task_id().as_str(), "t1");
    }

    #[tokio::test]
    async fn resolver_failure_is_conversion_error() {
        let resolver = FnResolver::new(|_, _| async {
            Err::<Option<Capability>, BoxError>("search down".into())
        });
        let stage = DynamicConversionStage::new(Arc::new(resolver));
        let err = stage
            .process(&item(json!(ADDRESS)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conversion");
        assert_eq!(err.task_id().map(TaskId::as_str), Some("t1"));
    }

    #[tokio::test]
    async fn capability_failure_is_conversion_error() {
        let resolver = FnResolver::new(|_, _| async {
            Ok(Some(Capability::new("broken", |_| async {
                Err::<Value, BoxError>("bad input".into())
            })))
        });
        let stage = DynamicConversionStage::new(Arc::new(resolver));
        let err = stage
            .process(&item(json!(ADDRESS)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolpipeError::Conversion { .. }));
        assert!(err.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn registry_resolver_maps_type_tags() {
        let tools = ToolRegistry::new().with(Capability::from_fn("to_symbol", |_| json!("ETH")));
        let resolver = RegistryResolver::new(
            tools,
            BTreeMap::from([
                ("string".to_string(), "to_symbol".to_string()),
                ("object".to_string(), "missing".to_string()),
            ]),
        );

        let hit = resolver
            .resolve(&CapabilityQuery::describe(&json!(ADDRESS), 100), "")
            .await
            .expect("resolve");
        assert_eq!(hit.map(|c| c.name().to_string()).as_deref(), Some("to_symbol"));

        let miss = resolver
            .resolve(&CapabilityQuery::describe(&json!(1), 100), "")
            .await
            .expect("resolve");
        assert!(miss.is_none());

        let misconfigured = resolver
            .resolve(&CapabilityQuery::describe(&json!({}), 100), "")
            .await;
        assert!(misconfigured.is_err());
    }

    #[tokio::test]
    async fn cancellation_while_resolving() {
        let resolver = FnResolver::new(|_, _| async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(None)
        });
        let stage = DynamicConversionStage::new(Arc::new(resolver));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = stage
            .process(&item(json!(ADDRESS)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolpipeError::Cancelled { .. }));
        assert_eq!(err.stage(), Some(CONVERTER_STAGE_NAME));
    }

    #[tokio::test]
    async fn cancellation_while_converting() {
        let resolver = FnResolver::new(|_, _| async {
            Ok(Some(Capability::new("slow_symbol", |v| async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok::<Value, BoxError>(v)
            })))
        });
        let stage = DynamicConversionStage::new(Arc::new(resolver));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = stage
            .process(&item(json!(ADDRESS)), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(err.task_id().map(TaskId::as_str), Some("t1"));
    }
}
