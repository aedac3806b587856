use crate::agent::environment::{
    Environment, EnvironmentFactory, EnvironmentSeed, ExecutionOutcome, HostBridge, HostError,
    HostErrorKind, ToolStub, VariableInfo,
};
use crate::agent::tools::ToolArgs;
use crate::config::ExecutionConfig;
use crate::errors::RlmError;
use crate::utils::subprocess::scrubbed_command;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Runner script executed with `python -u -c`. Speaks newline-delimited JSON.
const RUNNER: &str = include_str!("runner.py");

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an interrupted snippet gets to report back before the interpreter is
/// considered dead.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);
const MAX_LOGGED_LINE: usize = 200;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Init {
        session_id: &'a str,
        context: Option<&'a Value>,
        tools: &'a [ToolStub],
    },
    Exec {
        id: u64,
        code: &'a str,
    },
    HostResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<HostErrorKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostMessage<'_> {
    fn host_result(reply: Result<Value, HostError>) -> Self {
        match reply {
            Ok(value) => Self::HostResult {
                ok: true,
                value: Some(value),
                kind: None,
                error: None,
            },
            Err(e) => Self::HostResult {
                ok: false,
                value: None,
                kind: Some(e.kind),
                error: Some(e.message),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunnerEvent {
    Ready,
    HostCall {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    ExecResult {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        output: String,
        #[serde(default)]
        returned: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        final_value: Value,
        #[serde(default)]
        variables: Vec<VariableInfo>,
    },
}

/// Persistent Python interpreter holding one session's namespace.
pub struct PythonRepl {
    session_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    exec_timeout: Duration,
    next_exec_id: u64,
    dead: bool,
}

impl PythonRepl {
    pub async fn start(config: &ExecutionConfig, seed: EnvironmentSeed) -> Result<Self, RlmError> {
        Self::spawn(config, &seed).await.map_err(environment_error)
    }

    async fn spawn(config: &ExecutionConfig, seed: &EnvironmentSeed) -> Result<Self> {
        let program = which::which(&config.python_command).with_context(|| {
            format!(
                "python interpreter '{}' not found in PATH",
                config.python_command
            )
        })?;

        let mut cmd = scrubbed_command(&program, &config.pass_env);
        cmd.args(&config.python_args)
            .arg("-u")
            .arg("-c")
            .arg(RUNNER)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;
        let stdin = child.stdin.take().context("failed to capture python stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture python stdout")?;
        if let Some(stderr) = child.stderr.take() {
            let session_id = seed.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] python: {}", session_id, line);
                }
            });
        }

        let mut repl = Self {
            session_id: seed.session_id.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            exec_timeout: Duration::from_secs(config.exec_timeout_secs),
            next_exec_id: 0,
            dead: false,
        };

        repl.send(&HostMessage::Init {
            session_id: &seed.session_id,
            context: seed.context.as_ref(),
            tools: &seed.tools,
        })
        .await?;
        match tokio::time::timeout(STARTUP_TIMEOUT, repl.next_event()).await {
            Ok(Ok(RunnerEvent::Ready)) => {
                debug!(
                    "[{}] python REPL ready (pid {:?}, {} tools)",
                    repl.session_id,
                    repl.child.id(),
                    seed.tools.len()
                );
                Ok(repl)
            }
            Ok(Ok(other)) => anyhow::bail!("unexpected first message from runner: {:?}", other),
            Ok(Err(e)) => Err(e.context("python REPL failed to start")),
            Err(_) => anyhow::bail!(
                "python REPL did not become ready within {}s",
                STARTUP_TIMEOUT.as_secs()
            ),
        }
    }

    async fn send(&mut self, message: &HostMessage<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .context("failed to write to python REPL")?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Cancel-safe: `Lines::next_line` keeps partial input across dropped calls.
    async fn next_event(&mut self) -> Result<RunnerEvent> {
        let Some(line) = self.stdout.next_line().await? else {
            anyhow::bail!("python interpreter exited unexpectedly");
        };
        serde_json::from_str(line.trim()).with_context(|| {
            let end = crate::agent::truncation::floor_char_boundary(&line, MAX_LOGGED_LINE);
            format!("invalid message from python runner: {}", &line[..end])
        })
    }

    /// Deliver SIGINT so the running snippet raises `KeyboardInterrupt`.
    #[cfg(unix)]
    fn interrupt(&self) -> bool {
        let Some(pid) = self.child.id().and_then(|id| libc::pid_t::try_from(id).ok()) else {
            return false;
        };
        // SAFETY: kill(2) on a child we spawned and still own; no memory is shared.
        unsafe { libc::kill(pid, libc::SIGINT) == 0 }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> bool {
        false
    }

    async fn run_snippet(
        &mut self,
        code: &str,
        host: &dyn HostBridge,
    ) -> Result<ExecutionOutcome, RlmError> {
        self.next_exec_id += 1;
        let exec_id = self.next_exec_id;
        self.send(&HostMessage::Exec { id: exec_id, code })
            .await
            .map_err(environment_error)?;

        let limit_secs = self.exec_timeout.as_secs();
        let mut deadline = Instant::now() + self.exec_timeout;
        let mut interrupted = false;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.next_event()).await {
                Ok(event) => event.map_err(environment_error)?,
                Err(_) if interrupted => {
                    return Err(RlmError::Environment {
                        message: format!(
                            "interpreter did not recover within {}s of being interrupted",
                            INTERRUPT_GRACE.as_secs()
                        ),
                    });
                }
                Err(_) => {
                    warn!(
                        "[{}] snippet exceeded {}s, interrupting",
                        self.session_id, limit_secs
                    );
                    if !self.interrupt() {
                        warn!("[{}] failed to signal python REPL", self.session_id);
                    }
                    interrupted = true;
                    deadline = Instant::now() + INTERRUPT_GRACE;
                    continue;
                }
            };

            match event {
                RunnerEvent::HostCall { name, args, kwargs } => {
                    let reply = if interrupted {
                        Err(HostError::new(
                            HostErrorKind::Timeout,
                            format!("snippet exceeded {}s", limit_secs),
                        ))
                    } else {
                        let call = host.call(&name, ToolArgs::new(args, kwargs));
                        match tokio::time::timeout_at(deadline, call).await {
                            Ok(reply) => reply,
                            Err(_) => {
                                warn!(
                                    "[{}] snippet exceeded {}s during host call '{}'",
                                    self.session_id, limit_secs, name
                                );
                                interrupted = true;
                                deadline = Instant::now() + INTERRUPT_GRACE;
                                Err(HostError::new(
                                    HostErrorKind::Timeout,
                                    format!("host call '{}' cancelled after {}s", name, limit_secs),
                                ))
                            }
                        }
                    };
                    self.send(&HostMessage::host_result(reply))
                        .await
                        .map_err(environment_error)?;
                }
                RunnerEvent::ExecResult { id, .. } if id.is_some_and(|id| id != exec_id) => {
                    debug!(
                        "[{}] dropping stale result for exec {:?}",
                        self.session_id, id
                    );
                }
                RunnerEvent::ExecResult {
                    output,
                    returned,
                    error,
                    is_final,
                    final_value,
                    variables,
                    ..
                } => {
                    let error = match error {
                        Some(_) if interrupted => Some(format!(
                            "TimeoutError: snippet exceeded the {}s execution limit and was interrupted",
                            limit_secs
                        )),
                        other => other,
                    };
                    return Ok(ExecutionOutcome {
                        output,
                        returned: returned.filter(|v| !v.is_null()),
                        error,
                        final_value: is_final.then_some(final_value),
                        variables,
                    });
                }
                RunnerEvent::Ready => {
                    debug!("[{}] ignoring repeated ready message", self.session_id);
                }
            }
        }
    }
}

#[async_trait]
impl Environment for PythonRepl {
    async fn execute(
        &mut self,
        code: &str,
        host: &dyn HostBridge,
    ) -> Result<ExecutionOutcome, RlmError> {
        if self.dead {
            return Err(RlmError::Environment {
                message: "python interpreter is no longer running".to_string(),
            });
        }
        let result = self.run_snippet(code, host).await;
        if result.is_err() {
            self.dead = true;
        }
        result
    }

    async fn shutdown(&mut self) {
        let _ = self.stdin.shutdown().await;
        if tokio::time::timeout(Duration::from_secs(1), self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
        debug!("[{}] python REPL shut down", self.session_id);
    }
}

fn environment_error(e: impl std::fmt::Display) -> RlmError {
    RlmError::Environment {
        message: format!("{:#}", e),
    }
}

/// Starts one [`PythonRepl`] per session.
pub struct PythonEnvironmentFactory {
    config: ExecutionConfig,
}

impl PythonEnvironmentFactory {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EnvironmentFactory for PythonEnvironmentFactory {
    async fn create(&self, seed: EnvironmentSeed) -> Result<Box<dyn Environment>, RlmError> {
        let repl = PythonRepl::start(&self.config, seed).await?;
        Ok(Box::new(repl))
    }
}

#[cfg(test)]
mod tests;
