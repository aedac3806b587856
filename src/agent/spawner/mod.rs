use crate::agent::compaction::estimate_tokens;
use crate::agent::rlm::{Outcome, RlmResult, SessionFrame, Shared, Task, run_session, until};
use crate::agent::truncation::preview;
use crate::agent::usage::UsageTracker;
use crate::errors::RlmError;
use crate::providers::base::{ChatRequest, Message};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Runs child sessions on behalf of one parent session.
///
/// Children share the parent's deadline, start with the parent's remaining cost
/// and token budget, and record usage into a tracker linked to the parent's, so
/// the parent's totals already include a child's spend when the call returns.
pub struct Spawner {
    shared: Arc<Shared>,
    parent: SessionFrame,
    session_id: String,
    children: AtomicU32,
}

impl Spawner {
    pub(crate) fn new(shared: Arc<Shared>, parent: SessionFrame, session_id: String) -> Self {
        Self {
            shared,
            parent,
            session_id,
            children: AtomicU32::new(0),
        }
    }

    pub fn children_spawned(&self) -> u32 {
        self.children.load(Ordering::Relaxed)
    }

    /// Frame for a new child, or `DepthExceeded` when the parent is already at the limit.
    fn child_frame(&self) -> Result<SessionFrame, RlmError> {
        let depth = self.parent.depth + 1;
        let max_depth = self.parent.limits.max_depth;
        if depth > max_depth {
            debug!(
                "[{}] refusing spawn at depth {} (max {})",
                self.session_id, depth, max_depth
            );
            return Err(RlmError::DepthExceeded { depth, max_depth });
        }

        let mut limits = self.parent.limits.clone();
        limits.usage = self.parent.tracker.remaining(&self.parent.limits.usage);
        if let Some(max_iterations) = self.shared.config.spawn.child_max_iterations {
            limits.max_iterations = max_iterations;
        }
        Ok(SessionFrame {
            depth,
            model: self.shared.config.child_model().to_string(),
            limits,
            tracker: Arc::new(UsageTracker::child_of(&self.parent.tracker)),
            tree: self.parent.tree.clone(),
            tree_limits: self.parent.tree_limits,
        })
    }

    fn run_child(
        &self,
        frame: SessionFrame,
        task: Task,
    ) -> BoxFuture<'static, Result<Value, RlmError>> {
        let n = self.children.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[{}] spawning child #{} at depth {}: {}",
            self.session_id,
            n,
            frame.depth,
            preview(&task.instruction, 80)
        );
        let session = run_session(self.shared.clone(), frame, task);
        Box::pin(async move { child_value(session.await) })
    }

    /// Run one child session to completion and return its answer.
    pub async fn rlm_query(&self, task: Task) -> Result<Value, RlmError> {
        let frame = self.child_frame()?;
        self.run_child(frame, task).await
    }

    /// Run children concurrently, at most `spawn.max_concurrent` at a time.
    ///
    /// Results keep the order of `tasks`. A child failure that must end the
    /// parent is returned as `Err` right away, and dropping the remaining
    /// stream cancels the siblings still running.
    pub async fn rlm_query_batched(
        &self,
        tasks: Vec<Task>,
    ) -> Result<Vec<Result<Value, RlmError>>, RlmError> {
        let mut children = Vec::with_capacity(tasks.len());
        for task in tasks {
            let frame = self.child_frame()?;
            children.push(self.run_child(frame, task));
        }
        let total = children.len();
        let mut results = Vec::with_capacity(total);
        let mut running =
            stream::iter(children).buffered(self.shared.config.spawn.max_concurrent.max(1));
        while let Some(result) = running.next().await {
            match result {
                Err(e) if e.propagates_to_parent() => {
                    warn!(
                        "[{}] batched child failed after {}/{} results: {}",
                        self.session_id,
                        results.len(),
                        total,
                        e
                    );
                    return Err(e);
                }
                other => results.push(other),
            }
        }
        Ok(results)
    }

    /// One plain backend call with no REPL, charged to the parent session.
    pub async fn llm_query(&self, prompt: String) -> Result<Value, RlmError> {
        self.parent.check_budgets()?;
        let config = &self.shared.config;
        let model = config.child_model();
        let prompt_estimate = estimate_tokens(&prompt) as u64;
        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            model: Some(model),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };
        let call = self
            .shared
            .provider
            .chat_with_retry(request, Some(self.shared.retry.clone()));
        let response = match until(self.parent.limits.deadline(), call).await {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                return Err(RlmError::Provider {
                    message: format!("{:#}", e),
                });
            }
            None => return Err(self.parent.limits.timeout_error()),
        };
        self.parent
            .tracker
            .record_response(model, &response, prompt_estimate);
        debug!(
            "[{}] llm_query answered with {} chars",
            self.session_id,
            response.content_str().len()
        );
        Ok(Value::String(response.content_str().to_string()))
    }
}

/// What a finished child hands back to the calling snippet.
fn child_value(result: RlmResult) -> Result<Value, RlmError> {
    match result.outcome {
        Outcome::Completed => Ok(result.response.unwrap_or(Value::Null)),
        Outcome::Failed(err) if err.is_iteration_cap() => result.response.ok_or(err),
        Outcome::Failed(err) => Err(err),
    }
}
