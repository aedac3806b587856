mod host;
mod parse;
mod prompt;

pub use parse::{FinalMarker, ParsedResponse, parse_response};

use crate::agent::compaction::{TranscriptCompactor, estimate_tokens};
use crate::agent::environment::{
    Environment, EnvironmentFactory, EnvironmentSeed, PythonEnvironmentFactory, ToolStub,
};
use crate::agent::tools::{Tool, ToolRegistry};
use crate::agent::truncation::preview;
use crate::agent::usage::{PricingTable, UsageLimits, UsageSummary, UsageTracker};
use crate::config::{ErrorThresholdConfig, RlmConfig};
use crate::errors::{BudgetKind, OxirlmError, RlmError};
use crate::providers::base::{ChatRequest, LLMProvider, RetryConfig};
use crate::session::{Observation, Session, Turn};
use futures_util::future::BoxFuture;
use host::SessionHost;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NO_CODE_REMINDER: &str = "No ```repl code block or FINAL(...) line was found in your response. Write Python in a ```repl block to make progress, or finish with FINAL(answer) or FINAL_VAR(variable_name).";
const TURN_LOG_PREVIEW_CHARS: usize = 200;

/// One unit of work: an instruction plus optional data bound as `context`.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub instruction: String,
    pub context: Option<Value>,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(RlmError),
}

/// Everything a session produced, whether it finished or not.
#[derive(Debug, Clone)]
pub struct RlmResult {
    /// The final answer, or the best available answer on failure.
    pub response: Option<Value>,
    pub outcome: Outcome,
    /// Usage of this session and every session it spawned.
    pub usage: UsageSummary,
    pub execution_time: Duration,
    pub metadata: Map<String, Value>,
    pub transcript: Vec<Turn>,
}

impl RlmResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn error(&self) -> Option<&RlmError> {
        match &self.outcome {
            Outcome::Completed => None,
            Outcome::Failed(e) => Some(e),
        }
    }

    /// The response as text: strings verbatim, anything else as JSON.
    pub fn response_text(&self) -> Option<String> {
        self.response.as_ref().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn into_result(self) -> Result<Value, RlmError> {
        match self.outcome {
            Outcome::Completed => Ok(self.response.unwrap_or(Value::Null)),
            Outcome::Failed(e) => Err(e),
        }
    }
}

/// Read-only limits of one session.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_iterations: u32,
    pub max_depth: u32,
    /// Start of the root session; the deadline is measured from here for the whole tree.
    pub started_at: Instant,
    pub timeout: Option<Duration>,
    pub usage: UsageLimits,
    pub error_threshold: Option<ErrorThresholdConfig>,
}

impl Limits {
    pub fn from_config(config: &RlmConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_depth: config.max_depth,
            started_at: Instant::now(),
            timeout: config.timeout(),
            usage: UsageLimits {
                cost_budget: config.cost_budget,
                token_limit: config.token_limit,
            },
            error_threshold: config.error_threshold.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.started_at + t)
    }

    pub fn check_timeout(&self) -> Result<(), RlmError> {
        match self.timeout {
            Some(timeout) if self.started_at.elapsed() >= timeout => Err(self.timeout_error()),
            _ => Ok(()),
        }
    }

    pub fn timeout_error(&self) -> RlmError {
        let elapsed = self.started_at.elapsed();
        RlmError::TimeoutExceeded {
            elapsed,
            timeout: self.timeout.unwrap_or(elapsed),
        }
    }
}

/// Per-session parameters of the reentrant loop.
#[derive(Clone)]
pub(crate) struct SessionFrame {
    pub(crate) depth: u32,
    pub(crate) model: String,
    pub(crate) limits: Limits,
    /// This session's subtree usage.
    pub(crate) tracker: Arc<UsageTracker>,
    /// Root tracker, checked against the configured ceilings so siblings running
    /// in parallel cannot jointly overspend.
    pub(crate) tree: Arc<UsageTracker>,
    pub(crate) tree_limits: UsageLimits,
}

impl SessionFrame {
    fn root(config: &RlmConfig, pricing: Arc<PricingTable>) -> Self {
        let limits = Limits::from_config(config);
        let tracker = Arc::new(UsageTracker::new(pricing));
        Self {
            depth: 0,
            model: config.model.clone(),
            tree: tracker.clone(),
            tree_limits: limits.usage,
            tracker,
            limits,
        }
    }

    /// Timeout, then cost, then tokens.
    pub(crate) fn check_budgets(&self) -> Result<(), RlmError> {
        self.limits.check_timeout()?;
        self.tracker.check_limits(&self.limits.usage)?;
        if !Arc::ptr_eq(&self.tracker, &self.tree) {
            self.tree.check_limits(&self.tree_limits)?;
        }
        Ok(())
    }
}

/// Engine-wide state shared by every session of a spawn tree.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) config: RlmConfig,
    pub(crate) provider: Arc<dyn LLMProvider>,
    pub(crate) environments: Arc<dyn EnvironmentFactory>,
    pub(crate) tools: ToolRegistry,
    pub(crate) compactor: Option<Arc<TranscriptCompactor>>,
    pub(crate) pricing: Arc<PricingTable>,
    pub(crate) retry: RetryConfig,
}

impl Shared {
    fn tool_stubs(&self) -> Vec<ToolStub> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolStub {
                name: name.to_string(),
                doc: format!("{}{}\n\n{}", name, tool.signature(), tool.description()),
            })
            .collect()
    }
}

/// Await `fut`, or give up at `deadline`.
pub(crate) async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Run one session to a terminal state. Re-entered by the spawner for children.
pub(crate) fn run_session(
    shared: Arc<Shared>,
    frame: SessionFrame,
    task: Task,
) -> BoxFuture<'static, RlmResult> {
    Box::pin(SessionRunner::new(shared, frame, task).run())
}

enum LoopState {
    AwaitingModel,
    Executing {
        model_output: String,
        snippet: String,
        /// `FINAL(text)` written after the code, honored if the code succeeds.
        answer: Option<String>,
    },
    Observing {
        turn: Turn,
        final_value: Option<Value>,
    },
    Terminal {
        response: Option<Value>,
        outcome: Outcome,
    },
}

struct SessionRunner {
    shared: Arc<Shared>,
    frame: SessionFrame,
    task: Task,
    session: Session,
    system: String,
    opening: String,
}

impl SessionRunner {
    fn new(shared: Arc<Shared>, frame: SessionFrame, task: Task) -> Self {
        let system = prompt::system_prompt(&shared.tools, frame.depth, frame.limits.max_depth);
        let opening = prompt::task_message(&task);
        Self {
            session: Session::new(frame.depth),
            shared,
            frame,
            task,
            system,
            opening,
        }
    }

    async fn run(mut self) -> RlmResult {
        let started = Instant::now();
        info!(
            "[{}] session started at depth {} with model {}",
            self.session.id, self.frame.depth, self.frame.model
        );
        let host = SessionHost::new(
            self.shared.clone(),
            self.frame.clone(),
            self.session.id.clone(),
        );
        let seed = EnvironmentSeed {
            session_id: self.session.id.clone(),
            context: self.task.context.clone(),
            tools: self.shared.tool_stubs(),
        };
        let created = until(
            self.frame.limits.deadline(),
            self.shared.environments.create(seed),
        )
        .await;

        let (response, outcome) = match created {
            Some(Ok(mut env)) => {
                let result = self.drive(env.as_mut(), &host).await;
                env.shutdown().await;
                result
            }
            Some(Err(e)) => {
                warn!("[{}] environment failed to start: {}", self.session.id, e);
                (None, Outcome::Failed(e))
            }
            None => (None, Outcome::Failed(self.frame.limits.timeout_error())),
        };
        self.finish(response, outcome, host.children_spawned(), started.elapsed())
    }

    async fn drive(
        &mut self,
        env: &mut dyn Environment,
        host: &SessionHost,
    ) -> (Option<Value>, Outcome) {
        let mut state = LoopState::AwaitingModel;
        loop {
            state = match state {
                LoopState::AwaitingModel => self.await_model().await,
                LoopState::Executing {
                    model_output,
                    snippet,
                    answer,
                } => self.execute(env, host, model_output, snippet, answer).await,
                LoopState::Observing { turn, final_value } => {
                    self.observe(host, turn, final_value).await
                }
                LoopState::Terminal { response, outcome } => return (response, outcome),
            };
        }
    }

    async fn await_model(&mut self) -> LoopState {
        if let Err(e) = self.frame.check_budgets() {
            return self.fail(e);
        }

        let messages = prompt::build_messages(
            &self.system,
            &self.opening,
            &self.session,
            self.frame.limits.max_iterations,
        );
        let prompt_estimate = messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>() as u64;
        let request = ChatRequest {
            messages,
            model: Some(&self.frame.model),
            max_tokens: self.shared.config.max_tokens,
            temperature: self.shared.config.temperature,
        };
        let call = self
            .shared
            .provider
            .chat_with_retry(request, Some(self.shared.retry.clone()));
        let response = match until(self.frame.limits.deadline(), call).await {
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                warn!("[{}] backend call failed: {:#}", self.session.id, e);
                return self.fail(RlmError::Provider {
                    message: format!("{:#}", e),
                });
            }
            None => return self.fail(self.frame.limits.timeout_error()),
        };
        self.frame
            .tracker
            .record_response(&self.frame.model, &response, prompt_estimate);

        let content = response.content_str().to_string();
        let iteration = self.session.iterations + 1;
        match parse_response(&content) {
            ParsedResponse::Code {
                snippet,
                final_marker,
            } => {
                let (snippet, answer) = match final_marker {
                    Some(FinalMarker::Var(expr)) => (format!("{}\nFINAL_VAR({})", snippet, expr), None),
                    Some(FinalMarker::Answer(text)) => (snippet, Some(text)),
                    None => (snippet, None),
                };
                LoopState::Executing {
                    model_output: content,
                    snippet,
                    answer,
                }
            }
            ParsedResponse::Final(FinalMarker::Answer(text)) => {
                info!(
                    "[{}] answered directly at iteration {}",
                    self.session.id, iteration
                );
                self.session
                    .turns
                    .push(Turn::final_answer(iteration, content));
                LoopState::Terminal {
                    response: Some(Value::String(text)),
                    outcome: Outcome::Completed,
                }
            }
            ParsedResponse::Final(marker) => LoopState::Executing {
                snippet: marker.as_snippet().unwrap_or_default(),
                model_output: content,
                answer: None,
            },
            ParsedResponse::Empty => {
                debug!(
                    "[{}] iteration {}: no code in response",
                    self.session.id, iteration
                );
                let reminder = Observation {
                    output: NO_CODE_REMINDER.to_string(),
                    ..Default::default()
                };
                LoopState::Observing {
                    turn: Turn::step(iteration, content, None, reminder),
                    final_value: None,
                }
            }
        }
    }

    async fn execute(
        &mut self,
        env: &mut dyn Environment,
        host: &SessionHost,
        model_output: String,
        snippet: String,
        answer: Option<String>,
    ) -> LoopState {
        let iteration = self.session.iterations + 1;
        debug!(
            "[{}] iteration {}: executing {} chars of code",
            self.session.id,
            iteration,
            snippet.len()
        );
        let result = until(self.frame.limits.deadline(), env.execute(&snippet, host)).await;
        let outcome = match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                warn!("[{}] environment failure: {}", self.session.id, e);
                let observation = Observation {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
                self.session
                    .record_step(Turn::step(iteration, model_output, Some(snippet), observation));
                return self.fail(e);
            }
            None => {
                let err = self.frame.limits.timeout_error();
                let observation = Observation {
                    error: Some(format!("TimeoutError: {}", err)),
                    ..Default::default()
                };
                self.session
                    .record_step(Turn::step(iteration, model_output, Some(snippet), observation));
                return self.fail(err);
            }
        };

        let observation = outcome.observation(self.shared.config.execution.max_output_chars);
        let final_value = match outcome.final_value {
            Some(value) => Some(value),
            None if outcome.error.is_none() => answer.map(Value::String),
            None => None,
        };
        self.session.variables = outcome.variables;
        LoopState::Observing {
            turn: Turn::step(iteration, model_output, Some(snippet), observation),
            final_value,
        }
    }

    async fn observe(
        &mut self,
        host: &SessionHost,
        turn: Turn,
        final_value: Option<Value>,
    ) -> LoopState {
        self.log_turn(&turn);
        self.session.record_step(turn);

        // A child's terminal error wins even if the snippet caught it.
        if let Some(err) = host.take_terminal() {
            return self.fail(err);
        }
        if let Some(value) = final_value {
            info!(
                "[{}] final answer after {} iterations",
                self.session.id, self.session.iterations
            );
            return LoopState::Terminal {
                response: Some(value),
                outcome: Outcome::Completed,
            };
        }
        if let Err(e) = self.frame.check_budgets() {
            return self.fail(e);
        }
        if let Some(threshold) = &self.frame.limits.error_threshold {
            let errors = self.session.error_count(threshold.mode);
            if errors >= threshold.count {
                return self.fail(RlmError::ErrorThresholdExceeded {
                    errors,
                    threshold: threshold.count,
                });
            }
        }
        if self.session.iterations >= self.frame.limits.max_iterations {
            return self.fail(RlmError::BudgetExceeded {
                kind: BudgetKind::Iterations {
                    iterations: self.session.iterations,
                    max_iterations: self.frame.limits.max_iterations,
                },
            });
        }

        if let Some(compactor) = &self.shared.compactor {
            let fixed_tokens = estimate_tokens(&self.system) + estimate_tokens(&self.opening);
            let compaction = compactor.maybe_compact(
                &self.task.instruction,
                &mut self.session.turns,
                fixed_tokens,
                &self.frame.tracker,
            );
            match until(self.frame.limits.deadline(), compaction).await {
                Some(Ok(true)) => {
                    self.session.compactions += 1;
                    info!(
                        "[{}] transcript compacted ({} so far)",
                        self.session.id, self.session.compactions
                    );
                }
                Some(Ok(false)) => {}
                Some(Err(e)) => {
                    warn!(
                        "[{}] compaction failed, continuing uncompacted: {:#}",
                        self.session.id, e
                    );
                }
                None => return self.fail(self.frame.limits.timeout_error()),
            }
        }
        LoopState::AwaitingModel
    }

    /// Terminal failure carrying the best answer seen so far.
    fn fail(&self, err: RlmError) -> LoopState {
        LoopState::Terminal {
            response: self.session.last_returned(),
            outcome: Outcome::Failed(err),
        }
    }

    fn log_turn(&self, turn: &Turn) {
        let text = preview(&turn.render(), TURN_LOG_PREVIEW_CHARS);
        if self.shared.config.verbose {
            info!("[{}] iteration {}: {}", self.session.id, turn.iteration, text);
        } else {
            debug!("[{}] iteration {}: {}", self.session.id, turn.iteration, text);
        }
    }

    fn finish(
        self,
        response: Option<Value>,
        outcome: Outcome,
        children: u32,
        execution_time: Duration,
    ) -> RlmResult {
        match &outcome {
            Outcome::Completed => info!(
                "[{}] session completed in {:.1}s ({} iterations)",
                self.session.id,
                execution_time.as_secs_f64(),
                self.session.iterations
            ),
            Outcome::Failed(e) => warn!(
                "[{}] session failed after {} iterations: {}",
                self.session.id, self.session.iterations, e
            ),
        }
        let mut metadata = Map::new();
        metadata.insert("session_id".into(), json!(self.session.id));
        metadata.insert("depth".into(), json!(self.frame.depth));
        metadata.insert("model".into(), json!(self.frame.model));
        metadata.insert("iterations".into(), json!(self.session.iterations));
        metadata.insert("errors".into(), json!(self.session.total_errors));
        metadata.insert("compactions".into(), json!(self.session.compactions));
        metadata.insert("children_spawned".into(), json!(children));
        if let Outcome::Failed(e) = &outcome {
            metadata.insert("error_kind".into(), json!(e.kind().as_str()));
        }
        RlmResult {
            response,
            outcome,
            usage: self.frame.tracker.summary(),
            execution_time,
            metadata,
            transcript: self.session.turns,
        }
    }
}

/// Recursive language model engine.
///
/// ```no_run
/// # async fn demo(provider: std::sync::Arc<dyn oxirlm::providers::base::LLMProvider>) {
/// let rlm = oxirlm::Rlm::new(oxirlm::RlmConfig::default(), provider).unwrap();
/// let result = rlm
///     .completion("List the keys", Some(serde_json::json!("a:1,b:2")))
///     .await;
/// println!("{:?}", result.response);
/// # }
/// ```
#[derive(Clone)]
pub struct Rlm {
    shared: Arc<Shared>,
}

impl Rlm {
    /// Fails only on invalid configuration.
    pub fn new(config: RlmConfig, provider: Arc<dyn LLMProvider>) -> Result<Self, OxirlmError> {
        config.validate()?;
        let retry = RetryConfig::from(&config.provider_retries);
        let pricing = Arc::new(PricingTable::new(&config.model_costs));
        let compactor = config.compaction.enabled.then(|| {
            Arc::new(TranscriptCompactor::new(
                provider.clone(),
                config.model.clone(),
                config.compaction.clone(),
                retry.clone(),
            ))
        });
        let environments: Arc<dyn EnvironmentFactory> =
            Arc::new(PythonEnvironmentFactory::new(config.execution.clone()));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                provider,
                environments,
                tools: ToolRegistry::new(),
                compactor,
                pricing,
                retry,
            }),
        })
    }

    /// Register a custom tool, available to this engine's sessions and all their children.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self, OxirlmError> {
        Arc::make_mut(&mut self.shared).tools.register(tool)?;
        Ok(self)
    }

    /// Replace the default Python interpreter.
    #[must_use]
    pub fn with_environment(mut self, factory: Arc<dyn EnvironmentFactory>) -> Self {
        Arc::make_mut(&mut self.shared).environments = factory;
        self
    }

    pub fn config(&self) -> &RlmConfig {
        &self.shared.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.shared.tools
    }

    /// Solve `instruction`, with `context` bound in the REPL. Never fails: the
    /// outcome, partial transcript and usage are all in the result.
    pub async fn completion(
        &self,
        instruction: impl Into<String>,
        context: Option<Value>,
    ) -> RlmResult {
        self.run(Task {
            instruction: instruction.into(),
            context,
        })
        .await
    }

    pub async fn run(&self, task: Task) -> RlmResult {
        let frame = SessionFrame::root(&self.shared.config, self.shared.pricing.clone());
        run_session(self.shared.clone(), frame, task).await
    }
}

#[cfg(test)]
pub(crate) mod tests;
