use crate::providers::base::RetryConfig;
use serde::{Deserialize, Serialize};

/// Per-million-token pricing used when the backend does not report a cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    #[serde(default, rename = "inputPerMillion")]
    pub input_per_million: f64,
    #[serde(default, rename = "outputPerMillion")]
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_delay_ms", rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms", rename = "maxDelayMs")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            ..Self::default()
        }
    }
}

fn default_max_retries() -> usize {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}
