use crate::agent::environment::VariableInfo;
use crate::config::ErrorThresholdMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnKind {
    /// Model output plus the environment's reaction to it.
    Step,
    /// Synthetic turn standing in for a compacted prefix.
    Summary,
    /// The model answered directly without running code.
    Final,
}

/// What the environment reported after running a snippet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub output: String,
    pub returned: Option<Value>,
    pub error: Option<String>,
}

impl Observation {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.output.is_empty() {
            parts.push(format!("stdout:\n{}", self.output.trim_end()));
        }
        if let Some(value) = self.returned.as_ref().filter(|v| !v.is_null()) {
            parts.push(format!("returned: {}", value));
        }
        if let Some(error) = &self.error {
            parts.push(format!("error: {}", error));
        }
        if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub kind: TurnKind,
    /// Iteration this turn belongs to (the last covered iteration for summaries).
    pub iteration: u32,
    /// Raw model text, or the summary text for `Summary` turns.
    pub model_output: String,
    pub snippet: Option<String>,
    pub observation: Option<Observation>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn step(
        iteration: u32,
        model_output: impl Into<String>,
        snippet: Option<String>,
        observation: Observation,
    ) -> Self {
        Self {
            kind: TurnKind::Step,
            iteration,
            model_output: model_output.into(),
            snippet,
            observation: Some(observation),
            timestamp: Utc::now(),
        }
    }

    pub fn summary(iteration: u32, text: impl Into<String>) -> Self {
        Self {
            kind: TurnKind::Summary,
            iteration,
            model_output: text.into(),
            snippet: None,
            observation: None,
            timestamp: Utc::now(),
        }
    }

    pub fn final_answer(iteration: u32, model_output: impl Into<String>) -> Self {
        Self {
            kind: TurnKind::Final,
            iteration,
            model_output: model_output.into(),
            snippet: None,
            observation: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.observation.as_ref().is_some_and(Observation::is_error)
    }

    /// Text form used both in prompts and for transcript size estimates.
    pub fn render(&self) -> String {
        match self.kind {
            TurnKind::Summary => format!("Summary of earlier iterations:\n{}", self.model_output),
            TurnKind::Final => self.model_output.clone(),
            TurnKind::Step => match &self.observation {
                Some(obs) => format!("{}\n\n{}", self.model_output, obs.render()),
                None => self.model_output.clone(),
            },
        }
    }
}

/// Mutable state of one orchestration run. Owned by exactly one loop.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub depth: u32,
    pub turns: Vec<Turn>,
    pub iterations: u32,
    pub consecutive_errors: u32,
    pub total_errors: u32,
    pub compactions: u32,
    /// Bindings reported by the environment after the latest execution.
    pub variables: Vec<VariableInfo>,
}

impl Session {
    pub fn new(depth: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string()[..8].to_string(),
            depth,
            turns: Vec::new(),
            iterations: 0,
            consecutive_errors: 0,
            total_errors: 0,
            compactions: 0,
            variables: Vec::new(),
        }
    }

    /// Append a step turn, advancing the iteration counter and error counters.
    /// Turns without a snippet leave the consecutive error streak alone.
    pub fn record_step(&mut self, turn: Turn) {
        self.iterations += 1;
        if turn.is_error() {
            self.consecutive_errors += 1;
            self.total_errors += 1;
        } else if turn.snippet.is_some() {
            self.consecutive_errors = 0;
        }
        self.turns.push(turn);
    }

    pub fn error_count(&self, mode: ErrorThresholdMode) -> u32 {
        match mode {
            ErrorThresholdMode::Consecutive => self.consecutive_errors,
            ErrorThresholdMode::Cumulative => self.total_errors,
        }
    }

    /// Most recent non-null value returned by a snippet, used as a best-effort answer.
    pub fn last_returned(&self) -> Option<Value> {
        self.turns
            .iter()
            .rev()
            .filter_map(|t| t.observation.as_ref())
            .filter_map(|o| o.returned.clone())
            .find(|v| !v.is_null())
    }
}
