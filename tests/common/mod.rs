// Shared test helpers; not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use oxirlm::agent::environment::VariableInfo;
use oxirlm::providers::base::{ChatRequest, LLMProvider, LLMResponse, Message};
use oxirlm::{
    Environment, EnvironmentFactory, EnvironmentSeed, ExecutionOutcome, HostBridge,
    HostErrorKind, Rlm, RlmConfig, RlmError, ToolArgs,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub model: Option<String>,
}

impl RecordedCall {
    /// Instruction of the session that made the call.
    pub fn task(&self) -> String {
        task_of(&self.messages)
    }
}

type Responder = dyn Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync;

pub struct MockLLMProvider {
    responses: Mutex<VecDeque<LLMResponse>>,
    responder: Option<Box<Responder>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl MockLLMProvider {
    /// Replies in order; runs dry with an error.
    pub fn with_responses(responses: Vec<LLMResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from(responses)),
            responder: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_texts(texts: &[&str]) -> Arc<Self> {
        Self::with_responses(texts.iter().map(|t| text_response(t)).collect())
    }

    /// Replies computed from each request, for concurrent sessions.
    pub fn with_responder<F>(f: F) -> Arc<Self>
    where
        F: Fn(&[Message]) -> anyhow::Result<LLMResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMProvider for MockLLMProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: req.messages.clone(),
            model: req.model.map(|s| s.to_string()),
        });
        if let Some(responder) = &self.responder {
            return responder(&req.messages);
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("mock provider ran out of responses"))
    }
}

// --- Response builders ---

/// 100 input and 20 output tokens at $0.001.
pub fn text_response(content: &str) -> LLMResponse {
    LLMResponse {
        content: Some(content.to_string()),
        input_tokens: Some(100),
        output_tokens: Some(20),
        cost: Some(0.001),
    }
}

pub fn code(body: &str) -> String {
    format!("```repl\n{}\n```", body)
}

pub fn task_of(messages: &[Message]) -> String {
    messages
        .get(1)
        .and_then(|m| m.content.strip_prefix("Task:\n"))
        .and_then(|rest| rest.split("\n\n").next())
        .unwrap_or_default()
        .to_string()
}

pub fn is_compaction_request(messages: &[Message]) -> bool {
    messages
        .first()
        .is_some_and(|m| m.content.starts_with("Summarize this transcript"))
}

// --- Scripted environment ---

/// Line-oriented stand-in for the Python REPL, one command per line:
///
/// - `print TEXT`
/// - `set NAME VALUE`
/// - `keys NAME`: bind the keys of a `k:v,k:v` string context
/// - `return VALUE` / `final VALUE` / `FINAL_VAR(NAME)`
/// - `raise MESSAGE`
/// - `sleep MILLIS`
/// - `call FUNCTION [JSON_ARGS] [-> NAME]`
/// - `try call ...`: a failed call binds `NAME` to null and execution goes on
///
/// A VALUE is a bound name, JSON, or else a bare string.
pub struct ScriptedEnvironment {
    vars: HashMap<String, Value>,
}

impl ScriptedEnvironment {
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
impl Environment for ScriptedEnvironment {
    async fn execute(
        &mut self,
        code: &str,
        host: &dyn HostBridge,
    ) -> Result<ExecutionOutcome, RlmError> {
        let mut out = ExecutionOutcome::default();
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (caught, line) = match line.strip_prefix("try ") {
                Some(rest) => (true, rest),
                None => (false, line),
            };
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
                "keys" => {
                    let context = self
                        .vars
                        .get("context")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let keys: Vec<Value> = context
                        .split(',')
                        .filter_map(|pair| pair.split(':').next())
                        .map(|k| Value::String(k.to_string()))
                        .collect();
                    self.vars.insert(rest.to_string(), Value::Array(keys));
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
                        Err(_) if caught => {
                            if let Some(target) = target {
                                self.vars.insert(target.to_string(), Value::Null);
                            }
                        }
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
        let mut names: Vec<&String> = self.vars.keys().filter(|n| *n != "context").collect();
        names.sort();
        out.variables = names
            .into_iter()
            .map(|name| VariableInfo {
                name: name.clone(),
                type_name: "object".into(),
                preview: self.vars[name].to_string(),
            })
            .collect();
        Ok(out)
    }

    async fn shutdown(&mut self) {}
}

#[derive(Default)]
pub struct ScriptedFactory {
    pub created: AtomicUsize,
}

#[async_trait]
impl EnvironmentFactory for ScriptedFactory {
    async fn create(&self, seed: EnvironmentSeed) -> Result<Box<dyn Environment>, RlmError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut vars = HashMap::new();
        vars.insert("context".to_string(), seed.context.unwrap_or(Value::Null));
        Ok(Box::new(ScriptedEnvironment { vars }))
    }
}

/// Defaults with fast, non-retrying provider calls.
pub fn test_config() -> RlmConfig {
    let mut config = RlmConfig::default();
    config.model = "root-model".into();
    config.provider_retries.max_retries = 0;
    config.provider_retries.initial_delay_ms = 1;
    config
}

pub fn scripted_engine(config: RlmConfig, provider: Arc<MockLLMProvider>) -> Rlm {
    Rlm::new(config, provider)
        .unwrap()
        .with_environment(Arc::new(ScriptedFactory::default()))
}

pub fn python_available() -> bool {
    which::which("python3").is_ok()
}
