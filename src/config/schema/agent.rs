use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "super::default_true")]
    pub enabled: bool,
    /// Fraction of `context_window_tokens` at which the transcript is summarized.
    #[serde(default = "default_threshold_pct", rename = "thresholdPct")]
    pub threshold_pct: f64,
    #[serde(default = "default_context_window", rename = "contextWindowTokens")]
    pub context_window_tokens: u64,
    /// Model used for summary calls. Falls back to the session's model.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_pct: default_threshold_pct(),
            context_window_tokens: default_context_window(),
            model: None,
        }
    }
}

fn default_threshold_pct() -> f64 {
    0.85
}

fn default_context_window() -> u64 {
    128_000
}

/// Whether the error threshold counts errors in a row or over the whole session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorThresholdMode {
    /// Reset by any successful execution (default).
    #[default]
    Consecutive,
    /// Never reset.
    Cumulative,
}

impl std::fmt::Display for ErrorThresholdMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consecutive => write!(f, "consecutive"),
            Self::Cumulative => write!(f, "cumulative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorThresholdConfig {
    pub count: u32,
    #[serde(default)]
    pub mode: ErrorThresholdMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Upper bound on children running at once for `rlm_query_batched`.
    #[serde(default = "default_max_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,
    /// Iteration cap for child sessions. Inherits `maxIterations` when unset.
    #[serde(default, rename = "childMaxIterations")]
    pub child_max_iterations: Option<u32>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            child_max_iterations: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
