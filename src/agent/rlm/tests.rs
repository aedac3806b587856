use super::*;
use crate::agent::environment::{ExecutionOutcome, HostBridge, HostErrorKind};
use crate::agent::tools::{FnTool, ToolArgs};
use crate::config::ErrorThresholdMode;
use crate::errors::ErrorKind;
use crate::providers::base::{LLMResponse, Message};
use crate::session::TurnKind;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// --- Test doubles shared with the spawner tests ---

type Responder = dyn Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync;

/// Provider that answers from a queue, or from a function of the request.
pub(crate) struct MockProvider {
    queue: Mutex<VecDeque<LLMResponse>>,
    responder: Option<Box<Responder>>,
    pub(crate) calls: Mutex<Vec<(Option<String>, Vec<Message>)>>,
}

impl MockProvider {
    pub(crate) fn scripted(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(replies.iter().map(|r| reply(r)).collect()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn responding<F>(f: F) -> Arc<Self>
    where
        F: Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((req.model.map(str::to_string), req.messages.clone()));
        if let Some(responder) = &self.responder {
            return responder(&req.messages);
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("mock provider has no more replies"))
    }
}

/// 100 input tokens, 20 output tokens, $0.001.
pub(crate) fn reply(text: &str) -> LLMResponse {
    LLMResponse {
        content: Some(text.to_string()),
        input_tokens: Some(100),
        output_tokens: Some(20),
        cost: Some(0.001),
    }
}

/// Instruction of the session a request belongs to.
pub(crate) fn task_of(messages: &[Message]) -> String {
    messages
        .get(1)
        .and_then(|m| m.content.strip_prefix("Task:\n"))
        .and_then(|rest| rest.split("\n\n").next())
        .unwrap_or_default()
        .to_string()
}

/// Line-oriented stand-in for the Python REPL.
///
/// `print TEXT`, `set NAME VALUE`, `return VALUE`, `final VALUE`,
/// `FINAL_VAR(NAME)`, `raise MSG`, `sleep MS` and `call NAME [ARGS] [-> NAME]`.
/// A VALUE is a bound name, JSON, or else a bare string.
pub(crate) struct ScriptedEnv {
    vars: HashMap<String, Value>,
}

impl ScriptedEnv {
    fn eval(&self, expr: &str) -> Value {
        let expr = expr.trim();
        self.vars
            .get(expr)
            .cloned()
            .or_else(|| serde_json::from_str(expr).ok())
            .unwrap_or_else(|| Value::String(expr.to_string()))
    }
}

#[async_trait]
impl Environment for ScriptedEnv {
    async fn execute(
        &mut self,
        code: &str,
        host: &dyn HostBridge,
    ) -> Result<ExecutionOutcome, RlmError> {
        let mut out = ExecutionOutcome::default();
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            match cmd {
                "print" => {
                    out.output.push_str(rest);
                    out.output.push('\n');
                }
                "set" => {
                    let (name, value) = rest.split_once(' ').unwrap_or((rest, "null"));
                    let value = self.eval(value);
                    self.vars.insert(name.to_string(), value);
                }
                "return" => out.returned = Some(self.eval(rest)),
                "final" => out.final_value = Some(self.eval(rest)),
                "raise" => {
                    out.error = Some(format!("RuntimeError: {}", rest));
                    break;
                }
                "sleep" => {
                    let ms = rest.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "call" => {
                    let (call, target) = match rest.split_once(" -> ") {
                        Some((call, target)) => (call, Some(target.trim())),
                        None => (rest, None),
                    };
                    let (name, args) = call.split_once(' ').unwrap_or((call, "[]"));
                    let positional = match self.eval(args) {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    match host.call(name, ToolArgs::new(positional, Map::new())).await {
                        Ok(value) => match target {
                            Some(target) => {
                                self.vars.insert(target.to_string(), value);
                            }
                            None => out.returned = Some(value),
                        },
                        Err(e) => {
                            let kind = match e.kind {
                                HostErrorKind::DepthExceeded => "DepthExceededError",
                                HostErrorKind::Terminal => "SessionTerminated",
                                HostErrorKind::Timeout => "TimeoutError",
                                HostErrorKind::Error => "RuntimeError",
                            };
                            out.error = Some(format!("{}: {}", kind, e.message));
                            break;
                        }
                    }
                }
                _ if line.starts_with("FINAL_VAR(") => {
                    let name = line
                        .trim_start_matches("FINAL_VAR(")
                        .trim_end_matches(')')
                        .trim()
                        .trim_matches(|c| c == '"' || c == '\'');
                    out.final_value = Some(
                        self.vars
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| Value::String(name.to_string())),
                    );
                }
                _ => {
                    out.error = Some(format!("SyntaxError: {}", line));
                    break;
                }
            }
        }
        out.variables = self
            .vars
            .iter()
            .filter(|(name, _)| name.as_str() != "context")
            .map(|(name, value)| crate::agent::environment::VariableInfo {
                name: name.clone(),
                type_name: "object".into(),
                preview: value.to_string(),
            })
            .collect();
        Ok(out)
    }

    async fn shutdown(&mut self) {}
}

#[derive(Default)]
pub(crate) struct ScriptedFactory {
    fail: bool,
    pub(crate) created: AtomicUsize,
}

impl ScriptedFactory {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            created: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EnvironmentFactory for ScriptedFactory {
    async fn create(&self, seed: EnvironmentSeed) -> Result<Box<dyn Environment>, RlmError> {
        if self.fail {
            return Err(RlmError::Environment {
                message: "interpreter not found".into(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut vars = HashMap::new();
        vars.insert("context".to_string(), seed.context.unwrap_or(Value::Null));
        Ok(Box::new(ScriptedEnv { vars }))
    }
}

pub(crate) fn test_config() -> RlmConfig {
    let mut config = RlmConfig::default();
    config.model = "root-model".into();
    config.provider_retries.max_retries = 0;
    config.provider_retries.initial_delay_ms = 1;
    config
}

pub(crate) fn engine(config: RlmConfig, provider: Arc<MockProvider>) -> Rlm {
    Rlm::new(config, provider)
        .unwrap()
        .with_environment(Arc::new(ScriptedFactory::default()))
}

pub(crate) fn shared_of(rlm: &Rlm) -> Arc<Shared> {
    rlm.shared.clone()
}

pub(crate) fn root_frame(rlm: &Rlm) -> SessionFrame {
    SessionFrame::root(&rlm.shared.config, rlm.shared.pricing.clone())
}

// --- Response parsing ---

#[test]
fn parse_plain_code_block() {
    let parsed = parse_response("Let me look.\n```repl\nprint(len(context))\n```\n");
    assert_eq!(
        parsed,
        ParsedResponse::Code {
            snippet: "print(len(context))".into(),
            final_marker: None,
        }
    );
}

#[test]
fn parse_concatenates_fences_in_order() {
    let text = "```python\na = 1\n```\nthen\n```\nb = a + 1\n```";
    match parse_response(text) {
        ParsedResponse::Code { snippet, .. } => assert_eq!(snippet, "a = 1\n\nb = a + 1"),
        other => panic!("expected code, got {:?}", other),
    }
}

#[test]
fn parse_final_answer_without_code() {
    assert_eq!(
        parse_response("All done.\nFINAL(\"42 apples\")"),
        ParsedResponse::Final(FinalMarker::Answer("42 apples".into()))
    );
}

#[test]
fn parse_final_answer_ignores_trailing_prose() {
    assert_eq!(
        parse_response("All done.\nFINAL(42)\n\nLet me know if you need more (happy to help)."),
        ParsedResponse::Final(FinalMarker::Answer("42".into()))
    );
}

#[test]
fn parse_final_var_wins_over_final() {
    assert_eq!(
        parse_response("FINAL_VAR(result)\nFINAL(ignored)"),
        ParsedResponse::Final(FinalMarker::Var("result".into()))
    );
}

#[test]
fn parse_marker_after_code_is_kept() {
    let parsed = parse_response("```repl\nx = 2\n```\nFINAL_VAR(x)");
    assert_eq!(
        parsed,
        ParsedResponse::Code {
            snippet: "x = 2".into(),
            final_marker: Some(FinalMarker::Var("x".into())),
        }
    );
}

#[test]
fn parse_ignores_markers_inside_fences_and_mid_sentence() {
    let parsed = parse_response("I will call FINAL(x) later.\n```repl\nFINAL_VAR(x)\n```");
    assert_eq!(
        parsed,
        ParsedResponse::Code {
            snippet: "FINAL_VAR(x)".into(),
            final_marker: None,
        }
    );
    assert_eq!(
        parse_response("Remember to use FINAL(answer) when done."),
        ParsedResponse::Empty
    );
}

#[test]
fn parse_empty_fence_is_no_code() {
    assert_eq!(parse_response("```repl\n   \n```"), ParsedResponse::Empty);
}

#[test]
fn final_var_marker_as_snippet() {
    assert_eq!(
        FinalMarker::Var("out".into()).as_snippet().as_deref(),
        Some("FINAL_VAR(out)")
    );
    assert_eq!(FinalMarker::Answer("x".into()).as_snippet(), None);
}

// --- Prompts ---

#[test]
fn system_prompt_advertises_recursion_only_below_max_depth() {
    let tools = ToolRegistry::new();
    let root = prompt::system_prompt(&tools, 0, 1);
    assert!(root.contains("rlm_query(task, context=None)"));
    assert!(!root.contains("{recursion}"));
    assert!(!root.contains("{tools}"));

    let leaf = prompt::system_prompt(&tools, 1, 1);
    assert!(leaf.contains("DepthExceededError"));
    assert!(!leaf.contains("rlm_query_batched(tasks"));
}

#[test]
fn system_prompt_lists_custom_tools() {
    let mut tools = ToolRegistry::new();
    tools
        .register(Arc::new(
            FnTool::sync("lookup", "Fetch a record by id.", |_| Ok(Value::Null))
                .with_signature("(id: int) -> dict"),
        ))
        .unwrap();
    let text = prompt::system_prompt(&tools, 0, 1);
    assert!(text.contains("`lookup(id: int) -> dict`: Fetch a record by id."));
}

#[test]
fn task_message_describes_context() {
    let msg = prompt::task_message(&Task::new("Count keys").with_context(json!({"a": 1, "b": 2})));
    assert!(msg.starts_with("Task:\nCount keys\n\n"));
    assert!(msg.contains("a dict with 2 keys (a, b)"));

    let msg = prompt::task_message(&Task::new("Say hi"));
    assert!(msg.contains("`context` is None"));
}

#[test]
fn build_messages_replays_turns_and_hints_variables() {
    let mut session = Session::new(0);
    session.record_step(Turn::step(
        1,
        "```repl\nx = 1\n```",
        Some("x = 1".into()),
        Observation {
            output: "hello\n".into(),
            ..Default::default()
        },
    ));
    session.variables = vec![crate::agent::environment::VariableInfo {
        name: "x".into(),
        type_name: "int".into(),
        preview: "1".into(),
    }];
    let messages = prompt::build_messages("SYS", "TASK", &session, 5);
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, ["system", "user", "assistant", "user", "user"]);
    assert!(messages[3].content.contains("stdout:\nhello"));
    let last = &messages[4].content;
    assert!(last.starts_with("Iteration 2 of 5."));
    assert!(last.contains("- x: int = 1"));
}

// --- Limits and results ---

#[test]
fn limits_without_timeout_have_no_deadline() {
    let limits = Limits::from_config(&test_config());
    assert!(limits.deadline().is_none());
    assert!(limits.check_timeout().is_ok());
}

#[tokio::test]
async fn until_gives_up_at_deadline() {
    let deadline = Some(Instant::now() + Duration::from_millis(20));
    let slow = tokio::time::sleep(Duration::from_secs(5));
    assert!(until(deadline, slow).await.is_none());
    assert_eq!(until(None, async { 7 }).await, Some(7));
}

#[test]
fn result_text_and_into_result() {
    let result = RlmResult {
        response: Some(json!(["a", "b"])),
        outcome: Outcome::Completed,
        usage: UsageSummary::default(),
        execution_time: Duration::ZERO,
        metadata: Map::new(),
        transcript: Vec::new(),
    };
    assert!(result.is_success());
    assert_eq!(result.response_text().as_deref(), Some("[\"a\",\"b\"]"));
    assert_eq!(result.into_result().unwrap(), json!(["a", "b"]));
}

// --- Engine construction ---

#[test]
fn with_tool_rejects_reserved_names() {
    let rlm = engine(test_config(), MockProvider::scripted(&[]));
    let err = rlm
        .with_tool(Arc::new(FnTool::sync("llm_query", "shadow", |_| {
            Ok(Value::Null)
        })))
        .err()
        .unwrap();
    assert!(err.to_string().contains("reserved"));
}

#[test]
fn new_rejects_invalid_config() {
    let mut config = test_config();
    config.max_iterations = 0;
    assert!(Rlm::new(config, MockProvider::scripted(&[])).is_err());
}

// --- Orchestration loop ---

#[tokio::test]
async fn direct_final_answer_takes_no_iterations() {
    let provider = MockProvider::scripted(&["The answer is simple.\nFINAL(42)"]);
    let rlm = engine(test_config(), provider.clone());
    let result = rlm.completion("What is six times seven?", None).await;

    assert!(result.is_success());
    assert_eq!(result.response, Some(json!("42")));
    assert_eq!(result.metadata["iterations"], json!(0));
    assert_eq!(result.transcript.len(), 1);
    assert_eq!(result.transcript[0].kind, TurnKind::Final);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn code_then_final_var_resolves_variable() {
    let provider = MockProvider::scripted(&[
        "```repl\nset keys [\"a\",\"b\"]\nprint 2\n```",
        "FINAL_VAR(keys)",
    ]);
    let rlm = engine(test_config(), provider.clone());
    let result = rlm.completion("List keys", Some(json!("a:1,b:2"))).await;

    assert!(result.is_success());
    assert_eq!(result.response, Some(json!(["a", "b"])));
    assert_eq!(result.metadata["iterations"], json!(2));
    assert_eq!(result.usage.total_calls(), 2);
    assert_eq!(result.usage.total_input_tokens(), 200);
}

#[tokio::test]
async fn final_text_after_failing_code_is_not_honored() {
    let provider = MockProvider::scripted(&[
        "```repl\nraise boom\n```\nFINAL(too early)",
        "FINAL(recovered)",
    ]);
    let rlm = engine(test_config(), provider);
    let result = rlm.completion("Try", None).await;
    assert_eq!(result.response, Some(json!("recovered")));
    assert!(result.transcript[0].is_error());
}

#[tokio::test]
async fn iteration_cap_returns_best_effort_response() {
    let mut config = test_config();
    config.max_iterations = 2;
    let provider = MockProvider::scripted(&[
        "```repl\nreturn 10\n```",
        "```repl\nreturn 11\n```",
        "FINAL(never reached)",
    ]);
    let rlm = engine(config, provider.clone());
    let result = rlm.completion("Loop", None).await;

    assert!(matches!(
        result.error(),
        Some(RlmError::BudgetExceeded {
            kind: BudgetKind::Iterations {
                iterations: 2,
                max_iterations: 2
            }
        })
    ));
    assert_eq!(result.response, Some(json!(11)));
    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.metadata["error_kind"], json!("budget_exceeded"));
}

#[tokio::test]
async fn response_without_code_gets_a_reminder() {
    let provider = MockProvider::scripted(&["I am thinking about it.", "FINAL(ok)"]);
    let rlm = engine(test_config(), provider.clone());
    let result = rlm.completion("Think", None).await;

    assert!(result.is_success());
    assert_eq!(result.metadata["iterations"], json!(1));
    let calls = provider.calls.lock().unwrap();
    let second = &calls[1].1;
    assert!(
        second
            .iter()
            .any(|m| m.role == "user" && m.content.contains("No ```repl code block"))
    );
}

#[tokio::test]
async fn consecutive_error_threshold_ends_session() {
    let mut config = test_config();
    config.error_threshold = Some(ErrorThresholdConfig {
        count: 2,
        mode: ErrorThresholdMode::Consecutive,
    });
    let provider = MockProvider::scripted(&[
        "```repl\nraise one\n```",
        "```repl\nraise two\n```",
        "FINAL(unreachable)",
    ]);
    let rlm = engine(config, provider);
    let result = rlm.completion("Fail twice", None).await;
    assert_eq!(
        result.error(),
        Some(&RlmError::ErrorThresholdExceeded {
            errors: 2,
            threshold: 2
        })
    );
    assert_eq!(result.metadata["errors"], json!(2));
}

#[tokio::test]
async fn provider_failure_ends_session() {
    let provider = MockProvider::scripted(&[]);
    let rlm = engine(test_config(), provider);
    let result = rlm.completion("Anything", None).await;
    assert_eq!(result.error().map(RlmError::kind), Some(ErrorKind::Provider));
    assert!(result.response.is_none());
}

#[tokio::test]
async fn environment_startup_failure_is_reported() {
    let provider = MockProvider::scripted(&["FINAL(x)"]);
    let rlm = Rlm::new(test_config(), provider.clone())
        .unwrap()
        .with_environment(Arc::new(ScriptedFactory::failing()));
    let result = rlm.completion("Anything", None).await;
    assert_eq!(
        result.error().map(RlmError::kind),
        Some(ErrorKind::Environment)
    );
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn custom_tool_is_reachable_from_snippets() {
    let provider = MockProvider::scripted(&[
        "```repl\ncall add [2, 3] -> total\n```",
        "FINAL_VAR(total)",
    ]);
    let rlm = engine(test_config(), provider)
        .with_tool(Arc::new(FnTool::sync("add", "Add two numbers.", |args| {
            Ok(json!(args.f64(0, "a")? + args.f64(1, "b")?))
        })))
        .unwrap();
    let result = rlm.completion("Add", None).await;
    assert_eq!(result.response, Some(json!(5.0)));
}

#[tokio::test]
async fn metadata_carries_session_facts() {
    let provider = MockProvider::scripted(&["FINAL(done)"]);
    let rlm = engine(test_config(), provider);
    let result = rlm.completion("Quick", None).await;
    for key in [
        "session_id",
        "depth",
        "model",
        "iterations",
        "errors",
        "compactions",
        "children_spawned",
    ] {
        assert!(result.metadata.contains_key(key), "missing {}", key);
    }
    assert_eq!(result.metadata["model"], json!("root-model"));
    assert_eq!(result.metadata["depth"], json!(0));
}

#[tokio::test]
async fn cost_budget_is_checked_before_each_model_call() {
    let mut config = test_config();
    config.cost_budget = Some(0.0015);
    let provider = MockProvider::scripted(&[
        "```repl\nreturn 1\n```",
        "```repl\nreturn 2\n```",
        "```repl\nreturn 3\n```",
    ]);
    let rlm = engine(config, provider.clone());
    let result = rlm.completion("Spend", None).await;
    assert!(matches!(
        result.error(),
        Some(RlmError::BudgetExceeded {
            kind: BudgetKind::Cost { .. }
        })
    ));
    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.response, Some(json!(2)));
}
