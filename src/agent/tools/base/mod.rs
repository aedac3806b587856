use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Arguments of a call made from a snippet, as Python passed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    pub positional: Vec<Value>,
    pub keyword: Map<String, Value>,
}

impl ToolArgs {
    pub fn new(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    /// Argument passed either at position `index` or as keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword.get(name))
    }

    pub fn str(&self, index: usize, name: &str) -> anyhow::Result<&str> {
        self.get(index, name)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing string argument '{}'", name))
    }

    pub fn f64(&self, index: usize, name: &str) -> anyhow::Result<f64> {
        self.get(index, name)
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow::anyhow!("missing numeric argument '{}'", name))
    }
}

/// An externally supplied function callable by name from inside the REPL.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Python-style signature shown in the prompt, e.g. `(symbol: str) -> float`.
    fn signature(&self) -> String {
        "(*args, **kwargs)".to_string()
    }

    async fn call(&self, args: ToolArgs) -> anyhow::Result<Value>;

    /// Per-tool execution timeout. Overrides the registry-level default.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

type ToolFn = dyn Fn(ToolArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// [`Tool`] backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    signature: Option<String>,
    timeout: Option<Duration>,
    func: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            signature: None,
            timeout: None,
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }

    /// Wrap a synchronous function.
    pub fn sync<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(ToolArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(name, description, move |args| {
            let func = func.clone();
            async move { func(args) }
        })
    }

    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn signature(&self) -> String {
        self.signature
            .clone()
            .unwrap_or_else(|| "(*args, **kwargs)".to_string())
    }

    async fn call(&self, args: ToolArgs) -> anyhow::Result<Value> {
        (self.func)(args).await
    }

    fn execution_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(120))
    }
}
