//! Named, invokable external capabilities and the registry that holds them.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use toolpipe_shared::BoxError;

type InvokeFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync;

/// A named external transformation: a plain `{name, invoke}` value.
///
/// Cloning is cheap; clones share the same function.
#[derive(Clone)]
pub struct Capability {
    name: String,
    invoke: Arc<InvokeFn>,
}

impl Capability {
    /// Build a capability from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            invoke: Arc::new(move |payload| f(payload).boxed()),
        }
    }

    /// Build a capability from a synchronous, infallible transformation.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |payload| {
            let f = Arc::clone(&f);
            async move { Ok(f(payload)) }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the capability with `payload`.
    pub async fn invoke(&self, payload: Value) -> Result<Value, BoxError> {
        (self.invoke)(payload).await
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit name → capability registry, handed to whatever builds pipelines.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Capability>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous entry.
    pub fn register(&mut self, capability: Capability) -> &mut Self {
        self.tools.insert(capability.name().to_string(), capability);
        self
    }

    /// Builder-style [`ToolRegistry::register`].
    pub fn with(mut self, capability: Capability) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
