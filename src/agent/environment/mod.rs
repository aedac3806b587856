pub mod python;

pub use python::{PythonEnvironmentFactory, PythonRepl};

use crate::agent::tools::ToolArgs;
use crate::errors::RlmError;
use crate::session::Observation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A user-bound name in the REPL namespace, reported after each execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub preview: String,
}

impl VariableInfo {
    pub fn render(&self) -> String {
        format!("{}: {} = {}", self.name, self.type_name, self.preview)
    }
}

/// Everything a snippet execution produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// Captured stdout, plus the traceback when the snippet raised.
    pub output: String,
    /// Value of the snippet's trailing expression, if it had one.
    pub returned: Option<Value>,
    /// `"<Type>: <message>"` of an uncaught exception.
    pub error: Option<String>,
    /// Set when the snippet called `FINAL_VAR`/`FINAL`. `Some(Value::Null)` is a
    /// legitimate final answer.
    pub final_value: Option<Value>,
    pub variables: Vec<VariableInfo>,
}

impl ExecutionOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_final(&self) -> bool {
        self.final_value.is_some()
    }

    pub fn observation(&self, max_output_chars: usize) -> Observation {
        Observation {
            output: crate::agent::truncation::truncate_output(&self.output, max_output_chars),
            returned: self.returned.clone(),
            error: self.error.clone(),
        }
    }
}

/// A custom tool as the environment sees it: a name to bind and a docstring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStub {
    pub name: String,
    pub doc: String,
}

/// Initial namespace contents for a fresh environment.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSeed {
    pub session_id: String,
    pub context: Option<Value>,
    pub tools: Vec<ToolStub>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorKind {
    /// Ordinary failure, raised in the snippet as `RuntimeError`.
    Error,
    /// Spawn refused at maximum depth, raised as `DepthExceededError`.
    DepthExceeded,
    /// The session is ending; the snippet must unwind without handling it.
    Terminal,
    /// The snippet's time is up; raised as `KeyboardInterrupt`.
    Timeout,
}

/// Failure of a host call, delivered back into the calling snippet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::Error, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::Terminal, message)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<RlmError> for HostError {
    fn from(err: RlmError) -> Self {
        match err {
            RlmError::DepthExceeded { .. } => {
                Self::new(HostErrorKind::DepthExceeded, err.to_string())
            }
            e if e.propagates_to_parent() => Self::terminal(e.to_string()),
            e => Self::error(e.to_string()),
        }
    }
}

/// Host functions reachable from inside a snippet: custom tools and the
/// recursion primitives.
#[async_trait]
pub trait HostBridge: Send + Sync {
    async fn call(&self, name: &str, args: ToolArgs) -> Result<Value, HostError>;
}

/// A persistent interpreter whose namespace lives for one session.
///
/// `execute` only returns `Err` when the environment itself is unusable; snippet
/// failures are reported through [`ExecutionOutcome::error`].
#[async_trait]
pub trait Environment: Send {
    async fn execute(
        &mut self,
        code: &str,
        host: &dyn HostBridge,
    ) -> Result<ExecutionOutcome, RlmError>;

    async fn shutdown(&mut self);
}

#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(&self, seed: EnvironmentSeed) -> Result<Box<dyn Environment>, RlmError>;
}
