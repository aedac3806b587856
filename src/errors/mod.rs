use std::time::Duration;
use thiserror::Error;

/// Typed error hierarchy for construction and backend calls.
///
/// Use at module boundaries (provider calls, config validation).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum OxirlmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OxirlmError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::RateLimit { .. } | Self::Internal(_) => true,
            Self::Auth(_) | Self::Config(_) => false,
        }
    }
}

/// Which budget ran out.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetKind {
    Cost { spent: f64, budget: f64 },
    Iterations { iterations: u32, max_iterations: u32 },
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cost { spent, budget } => {
                write!(f, "cost ${:.6} reached budget ${:.6}", spent, budget)
            }
            Self::Iterations {
                iterations,
                max_iterations,
            } => write!(
                f,
                "{} iterations reached the cap of {}",
                iterations, max_iterations
            ),
        }
    }
}

/// Terminal and snippet-level conditions of an RLM session.
///
/// `Execution` and `DepthExceeded` are shown to the model and never end a session on
/// their own. Everything else ends the session it happens in; see
/// [`RlmError::propagates_to_parent`] for what crosses a spawn boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RlmError {
    #[error("Budget exceeded: {kind}")]
    BudgetExceeded { kind: BudgetKind },

    #[error(
        "Timeout exceeded: {:.1}s elapsed of {:.1}s allowed",
        elapsed.as_secs_f64(),
        timeout.as_secs_f64()
    )]
    TimeoutExceeded { elapsed: Duration, timeout: Duration },

    #[error("Token limit exceeded: {tokens} tokens used of {limit}")]
    TokenLimitExceeded { tokens: u64, limit: u64 },

    #[error("Error threshold exceeded: {errors} execution errors (threshold {threshold})")]
    ErrorThresholdExceeded { errors: u32, threshold: u32 },

    #[error("Recursion depth exceeded: depth {depth} is beyond max depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("Environment error: {message}")]
    Environment { message: String },
}

/// Payload-free discriminant of [`RlmError`], convenient for matching and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BudgetExceeded,
    TimeoutExceeded,
    TokenLimitExceeded,
    ErrorThresholdExceeded,
    DepthExceeded,
    Execution,
    Provider,
    Environment,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::TokenLimitExceeded => "token_limit_exceeded",
            Self::ErrorThresholdExceeded => "error_threshold_exceeded",
            Self::DepthExceeded => "depth_exceeded",
            Self::Execution => "execution",
            Self::Provider => "provider",
            Self::Environment => "environment",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::TimeoutExceeded { .. } => ErrorKind::TimeoutExceeded,
            Self::TokenLimitExceeded { .. } => ErrorKind::TokenLimitExceeded,
            Self::ErrorThresholdExceeded { .. } => ErrorKind::ErrorThresholdExceeded,
            Self::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Environment { .. } => ErrorKind::Environment,
        }
    }

    /// Whether a child session ending with this error also ends its parent.
    ///
    /// Budget, timeout, token, threshold and provider failures cross spawn
    /// boundaries. An exhausted iteration cap, a depth guard, a snippet error or a
    /// child interpreter that failed to start are reported to the calling snippet
    /// instead.
    pub fn propagates_to_parent(&self) -> bool {
        match self {
            Self::BudgetExceeded { kind } => matches!(kind, BudgetKind::Cost { .. }),
            Self::TimeoutExceeded { .. }
            | Self::TokenLimitExceeded { .. }
            | Self::ErrorThresholdExceeded { .. }
            | Self::Provider { .. } => true,
            Self::DepthExceeded { .. } | Self::Execution { .. } | Self::Environment { .. } => {
                false
            }
        }
    }

    pub fn is_iteration_cap(&self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded {
                kind: BudgetKind::Iterations { .. }
            }
        )
    }
}
