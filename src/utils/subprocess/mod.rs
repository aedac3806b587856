use std::ffi::OsStr;
use tokio::process::Command;

/// Environment variables safe to pass through to child processes.
const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "TERM",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
    "VIRTUAL_ENV",
    "PYTHONHOME",
    "PYTHONPATH",
];

/// Create a `Command` with a scrubbed environment.
///
/// Calls `env_clear()` then copies the allowlisted variables plus any names in
/// `pass_env` from the current process. Provider API keys never reach the REPL.
pub fn scrubbed_command(program: impl AsRef<OsStr>, pass_env: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    let extra = pass_env.iter().map(String::as_str);
    for var in ALLOWED_ENV_VARS.iter().copied().chain(extra) {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    cmd
}
