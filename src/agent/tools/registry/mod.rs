use crate::agent::tools::{Tool, ToolArgs};
use crate::errors::OxirlmError;
use crate::utils::regex::RegexPatterns;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Names bound by the engine itself in every REPL namespace.
pub const RESERVED_NAMES: &[&str] = &[
    "context",
    "rlm_query",
    "rlm_query_batched",
    "llm_query",
    "FINAL",
    "FINAL_VAR",
    "SHOW_VARS",
    "DepthExceededError",
];

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tool names become Python bindings, so they must be identifiers and must
    /// not shadow the engine's own functions.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), OxirlmError> {
        let name = tool.name().to_string();
        if !RegexPatterns::identifier().is_match(&name) || name.len() > 128 {
            return Err(OxirlmError::Config(format!(
                "tool name '{}' is not a valid Python identifier",
                name
            )));
        }
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(OxirlmError::Config(format!(
                "tool name '{}' is reserved by the engine",
                name
            )));
        }
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Returns a sorted list of all registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Iterate over all registered tools in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Tool>)> {
        self.tools.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Execute a tool in a spawned `tokio::task` with timeout and panic isolation.
    ///
    /// Every failure mode (unknown name, error, timeout, panic) comes back as an
    /// error message for the calling snippet rather than a fault of the loop.
    pub async fn execute(&self, name: &str, args: ToolArgs) -> Result<Value, String> {
        let Some(tool) = self.get(name) else {
            return Err(format!("Tool '{}' not found", name));
        };
        debug!(
            "Executing tool: {} ({} positional, {} keyword args)",
            name,
            args.positional.len(),
            args.keyword.len()
        );
        let timeout = tool.execution_timeout();
        let timeout_secs = timeout.as_secs();

        let handle =
            tokio::task::spawn(async move { tokio::time::timeout(timeout, tool.call(args)).await });

        match handle.await {
            Ok(Ok(Ok(value))) => {
                info!("Tool '{}' completed", name);
                Ok(value)
            }
            Ok(Ok(Err(e))) => {
                warn!("Tool '{}' returned error: {}", name, e);
                Err(format!("{}", e))
            }
            Ok(Err(_)) => {
                warn!("Tool '{}' timed out after {}s", name, timeout_secs);
                Err(format!("Tool '{}' timed out after {}s", name, timeout_secs))
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    // into_panic() consumes the JoinError so we must extract in one step.
                    let panic_payload = join_err.into_panic();
                    let panic_msg = panic_payload
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| panic_payload.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown cause");
                    error!("Tool '{}' panicked: {}", name, panic_msg);
                    Err(format!("Tool '{}' crashed: {}", name, panic_msg))
                } else {
                    Err(format!("Tool '{}' was cancelled", name))
                }
            }
        }
    }
}
