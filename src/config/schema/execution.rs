use serde::{Deserialize, Serialize};

/// Settings for the Python interpreter that backs each session's REPL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Interpreter binary, resolved through `PATH` when not absolute.
    #[serde(default = "default_python_command", rename = "pythonCommand")]
    pub python_command: String,
    /// Extra arguments placed before the runner script.
    #[serde(default, rename = "pythonArgs")]
    pub python_args: Vec<String>,
    /// Per-snippet wall-clock limit.
    #[serde(default = "default_exec_timeout_secs", rename = "execTimeoutSecs")]
    pub exec_timeout_secs: u64,
    /// Captured stdout beyond this many characters is truncated before it reaches the model.
    #[serde(default = "default_max_output_chars", rename = "maxOutputChars")]
    pub max_output_chars: usize,
    /// Environment variables passed to the interpreter in addition to the built-in allowlist.
    #[serde(default, rename = "passEnv")]
    pub pass_env: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            python_command: default_python_command(),
            python_args: Vec::new(),
            exec_timeout_secs: default_exec_timeout_secs(),
            max_output_chars: default_max_output_chars(),
            pass_env: Vec::new(),
        }
    }
}

fn default_python_command() -> String {
    "python3".to_string()
}

fn default_exec_timeout_secs() -> u64 {
    120
}

fn default_max_output_chars() -> usize {
    20_000
}
