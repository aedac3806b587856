use crate::agent::environment::{HostBridge, HostError};
use crate::agent::rlm::{SessionFrame, Shared, Task};
use crate::agent::spawner::Spawner;
use crate::agent::tools::ToolArgs;
use crate::errors::RlmError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Routes a session's host calls: recursion primitives to the [`Spawner`],
/// everything else to the tool registry.
///
/// The first child failure that must end this session is parked in `terminal`.
/// The snippet is unwound with a terminal host error and the loop picks the
/// parked error up once the execution returns.
pub(crate) struct SessionHost {
    shared: Arc<Shared>,
    spawner: Spawner,
    session_id: String,
    terminal: Mutex<Option<RlmError>>,
}

impl SessionHost {
    pub(crate) fn new(shared: Arc<Shared>, frame: SessionFrame, session_id: String) -> Self {
        Self {
            spawner: Spawner::new(shared.clone(), frame, session_id.clone()),
            shared,
            session_id,
            terminal: Mutex::new(None),
        }
    }

    pub(crate) fn children_spawned(&self) -> u32 {
        self.spawner.children_spawned()
    }

    pub(crate) fn take_terminal(&self) -> Option<RlmError> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn terminal_message(&self) -> Option<String> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ToString::to_string)
    }

    fn settle(&self, name: &str, result: Result<Value, RlmError>) -> Result<Value, HostError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.propagates_to_parent() => {
                warn!(
                    "[{}] {} failed, ending session: {}",
                    self.session_id, name, e
                );
                let message = e.to_string();
                let mut slot = self.terminal.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(e);
                }
                Err(HostError::terminal(message))
            }
            Err(e) => Err(HostError::from(e)),
        }
    }
}

#[async_trait]
impl HostBridge for SessionHost {
    async fn call(&self, name: &str, args: ToolArgs) -> Result<Value, HostError> {
        if let Some(message) = self.terminal_message() {
            return Err(HostError::terminal(message));
        }
        match name {
            "rlm_query" => {
                let task = task_from_args(&args)?;
                let result = self.spawner.rlm_query(task).await;
                self.settle(name, result)
            }
            "rlm_query_batched" => {
                let tasks = tasks_from_args(&args)?;
                match self.spawner.rlm_query_batched(tasks).await {
                    Ok(results) => Ok(Value::Array(
                        results
                            .into_iter()
                            .map(|r| r.unwrap_or_else(|e| Value::String(format!("Error: {}", e))))
                            .collect(),
                    )),
                    Err(e) => self.settle(name, Err(e)),
                }
            }
            "llm_query" => {
                let prompt = args
                    .str(0, "prompt")
                    .map_err(|e| HostError::error(e.to_string()))?
                    .to_string();
                let result = self.spawner.llm_query(prompt).await;
                self.settle(name, result)
            }
            _ => self
                .shared
                .tools
                .execute(name, args)
                .await
                .map_err(HostError::error),
        }
    }
}

fn instruction_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn task_from_args(args: &ToolArgs) -> Result<Task, HostError> {
    let instruction = args
        .get(0, "task")
        .filter(|v| !v.is_null())
        .map(instruction_of)
        .ok_or_else(|| HostError::error("rlm_query() missing required argument 'task'"))?;
    let context = args.get(1, "context").filter(|v| !v.is_null()).cloned();
    Ok(Task {
        instruction,
        context,
    })
}

fn tasks_from_args(args: &ToolArgs) -> Result<Vec<Task>, HostError> {
    let tasks = args
        .get(0, "tasks")
        .and_then(Value::as_array)
        .ok_or_else(|| HostError::error("rlm_query_batched() expects a list of tasks"))?;
    let contexts = match args.get(1, "contexts").filter(|v| !v.is_null()) {
        None => None,
        Some(Value::Array(contexts)) if contexts.len() == tasks.len() => Some(contexts),
        Some(Value::Array(contexts)) => {
            return Err(HostError::error(format!(
                "rlm_query_batched() got {} contexts for {} tasks",
                contexts.len(),
                tasks.len()
            )));
        }
        Some(_) => {
            return Err(HostError::error(
                "rlm_query_batched() expects contexts to be a list",
            ));
        }
    };
    Ok(tasks
        .iter()
        .enumerate()
        .map(|(i, task)| Task {
            instruction: instruction_of(task),
            context: contexts
                .and_then(|c| c.get(i))
                .filter(|v| !v.is_null())
                .cloned(),
        })
        .collect())
}
