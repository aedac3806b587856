use crate::errors::OxirlmError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

mod agent;
mod execution;
mod providers;

pub use agent::*;
pub use execution::*;
pub use providers::*;

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_iterations() -> u32 {
    30
}

fn default_max_depth() -> u32 {
    1
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

/// Engine configuration, fixed for the lifetime of an [`crate::Rlm`].
///
/// Every limit is read-only per session. Child sessions inherit it with depth,
/// remaining time, remaining cost and remaining tokens adjusted at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Model for recursive children and `llm_query`. Falls back to `model`.
    #[serde(default, rename = "childModel")]
    pub child_model: Option<String>,
    #[serde(default = "default_max_iterations", rename = "maxIterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_depth", rename = "maxDepth")]
    pub max_depth: u32,
    /// Wall-clock limit for the whole spawn tree, in seconds.
    #[serde(default, rename = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
    /// Ceiling on input + output tokens across the spawn tree.
    #[serde(default, rename = "tokenLimit")]
    pub token_limit: Option<u64>,
    /// Ceiling on spend across the spawn tree, in dollars.
    #[serde(default, rename = "costBudget")]
    pub cost_budget: Option<f64>,
    #[serde(default, rename = "errorThreshold")]
    pub error_threshold: Option<ErrorThresholdConfig>,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default = "default_max_tokens", rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, rename = "providerRetries")]
    pub provider_retries: RetrySettings,
    /// Pricing by model-name prefix, e.g. `"gpt-4o"` matches `"gpt-4o-mini"`.
    #[serde(default, rename = "modelCosts")]
    pub model_costs: HashMap<String, ModelCost>,
    /// Log every turn at info level instead of debug.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            child_model: None,
            max_iterations: default_max_iterations(),
            max_depth: default_max_depth(),
            timeout_secs: None,
            token_limit: None,
            cost_budget: None,
            error_threshold: None,
            compaction: CompactionConfig::default(),
            execution: ExecutionConfig::default(),
            spawn: SpawnConfig::default(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            provider_retries: RetrySettings::default(),
            model_costs: HashMap::new(),
            verbose: false,
        }
    }
}

impl RlmConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn child_model(&self) -> &str {
        self.child_model.as_deref().unwrap_or(&self.model)
    }

    pub fn validate(&self) -> Result<(), OxirlmError> {
        self.validate_limits()?;
        self.validate_compaction()?;
        self.validate_execution()?;
        self.validate_costs()?;
        Ok(())
    }

    fn validate_limits(&self) -> Result<(), OxirlmError> {
        if self.model.trim().is_empty() {
            return Err(OxirlmError::Config("model must not be empty".into()));
        }
        if self.max_iterations == 0 {
            return Err(OxirlmError::Config("maxIterations must be > 0".into()));
        }
        if self.max_iterations > 10_000 {
            return Err(OxirlmError::Config(
                "maxIterations is unreasonably large (> 10,000)".into(),
            ));
        }
        if self.max_depth > 16 {
            return Err(OxirlmError::Config(
                "maxDepth is unreasonably large (> 16)".into(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(OxirlmError::Config("timeoutSecs must be > 0 when set".into()));
        }
        if self.token_limit == Some(0) {
            return Err(OxirlmError::Config("tokenLimit must be > 0 when set".into()));
        }
        if let Some(budget) = self.cost_budget
            && (budget.is_nan() || budget.is_infinite() || budget <= 0.0)
        {
            return Err(OxirlmError::Config(
                "costBudget must be a positive finite number".into(),
            ));
        }
        if let Some(threshold) = &self.error_threshold
            && threshold.count == 0
        {
            return Err(OxirlmError::Config("errorThreshold.count must be > 0".into()));
        }
        if self.max_tokens == 0 {
            return Err(OxirlmError::Config("maxTokens must be > 0".into()));
        }
        if self.temperature.is_nan()
            || self.temperature.is_infinite()
            || self.temperature < 0.0
            || self.temperature > 2.0
        {
            return Err(OxirlmError::Config(
                "temperature must be a finite number between 0.0 and 2.0".into(),
            ));
        }
        if self.spawn.max_concurrent == 0 {
            return Err(OxirlmError::Config("spawn.maxConcurrent must be > 0".into()));
        }
        if self.spawn.child_max_iterations == Some(0) {
            return Err(OxirlmError::Config(
                "spawn.childMaxIterations must be > 0 when set".into(),
            ));
        }
        Ok(())
    }

    fn validate_compaction(&self) -> Result<(), OxirlmError> {
        let c = &self.compaction;
        if c.enabled {
            if c.threshold_pct.is_nan() || c.threshold_pct <= 0.0 || c.threshold_pct > 1.0 {
                return Err(OxirlmError::Config(
                    "compaction.thresholdPct must be in (0.0, 1.0] when enabled".into(),
                ));
            }
            if c.context_window_tokens == 0 {
                return Err(OxirlmError::Config(
                    "compaction.contextWindowTokens must be > 0 when enabled".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_execution(&self) -> Result<(), OxirlmError> {
        let e = &self.execution;
        if e.python_command.trim().is_empty() {
            return Err(OxirlmError::Config(
                "execution.pythonCommand must not be empty".into(),
            ));
        }
        if e.exec_timeout_secs == 0 {
            return Err(OxirlmError::Config(
                "execution.execTimeoutSecs must be > 0".into(),
            ));
        }
        if e.max_output_chars == 0 {
            return Err(OxirlmError::Config(
                "execution.maxOutputChars must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn validate_costs(&self) -> Result<(), OxirlmError> {
        for (model_name, cost) in &self.model_costs {
            if cost.input_per_million.is_nan()
                || cost.input_per_million.is_infinite()
                || cost.input_per_million < 0.0
            {
                return Err(OxirlmError::Config(format!(
                    "modelCosts.{model_name}.inputPerMillion must be a non-negative finite number"
                )));
            }
            if cost.output_per_million.is_nan()
                || cost.output_per_million.is_infinite()
                || cost.output_per_million < 0.0
            {
                return Err(OxirlmError::Config(format!(
                    "modelCosts.{model_name}.outputPerMillion must be a non-negative finite number"
                )));
            }
        }
        Ok(())
    }
}
