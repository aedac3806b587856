#![warn(clippy::pedantic)]
// Noisy doc/signature lints
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference: format!("{}", x) over format!("{x}")
#![allow(clippy::uninlined_format_args)]
// Intentional casts for token counts, costs and sizes
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
// Loop and runner functions are long
#![allow(clippy::too_many_lines)]
// Module structure: tools follow the foo::FooTool pattern
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod config;
pub mod errors;
pub mod providers;
pub mod session;
pub(crate) mod utils;

pub use agent::environment::{
    Environment, EnvironmentFactory, EnvironmentSeed, ExecutionOutcome, HostBridge, HostError,
    HostErrorKind,
};
pub use agent::rlm::{Limits, Outcome, Rlm, RlmResult, Task};
pub use agent::tools::{FnTool, Tool, ToolArgs};
pub use agent::usage::{ModelUsageSummary, UsageSummary};
pub use config::RlmConfig;
pub use errors::{BudgetKind, ErrorKind, OxirlmError, RlmError};
pub use providers::base::{ChatRequest, LLMProvider, LLMResponse, Message};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
