use crate::config::ModelCost;
use crate::errors::{BudgetKind, RlmError};
use crate::providers::base::LLMResponse;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Counters for one model identity.
///
/// Cost is held in integer micro-dollars so that summing records is exact and
/// independent of order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsageSummary {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_micros: u64,
}

impl ModelUsageSummary {
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost_micros as f64 / MICROS_PER_DOLLAR
    }

    fn add(&mut self, other: &Self) {
        self.total_calls += other.total_calls;
        self.total_input_tokens += other.total_input_tokens;
        self.total_output_tokens += other.total_output_tokens;
        self.total_cost_micros += other.total_cost_micros;
    }
}

/// Per-model usage, keyed by model identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub model_usage_summaries: BTreeMap<String, ModelUsageSummary>,
}

impl UsageSummary {
    pub fn total_calls(&self) -> u64 {
        self.model_usage_summaries.values().map(|m| m.total_calls).sum()
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.model_usage_summaries
            .values()
            .map(|m| m.total_input_tokens)
            .sum()
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.model_usage_summaries
            .values()
            .map(|m| m.total_output_tokens)
            .sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens() + self.total_output_tokens()
    }

    pub fn total_cost_micros(&self) -> u64 {
        self.model_usage_summaries
            .values()
            .map(|m| m.total_cost_micros)
            .sum()
    }

    /// Total spend in dollars.
    pub fn total_cost(&self) -> f64 {
        self.total_cost_micros() as f64 / MICROS_PER_DOLLAR
    }

    /// Add every record of `other` into this summary, keyed by model.
    pub fn merge(&mut self, other: &UsageSummary) {
        for (model, usage) in &other.model_usage_summaries {
            self.model_usage_summaries
                .entry(model.clone())
                .or_default()
                .add(usage);
        }
    }
}

/// Ceilings checked against a tracker's running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageLimits {
    /// Dollars.
    pub cost_budget: Option<f64>,
    pub token_limit: Option<u64>,
}

/// Match model names against configured pricing, longest prefix first.
#[derive(Debug, Default)]
pub struct PricingTable {
    entries: Vec<(String, ModelCost)>,
}

impl PricingTable {
    pub fn new(model_costs: &HashMap<String, ModelCost>) -> Self {
        let mut entries: Vec<(String, ModelCost)> = model_costs
            .iter()
            .map(|(pattern, cost)| (pattern.clone(), cost.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelCost> {
        self.entries
            .iter()
            .find(|(pattern, _)| model.starts_with(pattern.as_str()))
            .map(|(_, cost)| cost)
    }

    /// Estimated cost in micro-dollars, or zero for unpriced models.
    pub fn estimate_micros(&self, model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
        let Some(cost) = self.lookup(model) else {
            return 0;
        };
        // $/1M tokens is numerically micro-dollars per token
        let micros = input_tokens as f64 * cost.input_per_million
            + output_tokens as f64 * cost.output_per_million;
        micros.round() as u64
    }
}

/// Thread-safe usage accumulator for one session.
///
/// A child tracker forwards every record to its ancestors as it happens, so a
/// parent's totals always cover the whole subtree below it. Siblings running
/// in parallel each lock the shared ancestors per record, so no update is lost.
#[derive(Debug)]
pub struct UsageTracker {
    records: Mutex<BTreeMap<String, ModelUsageSummary>>,
    parent: Option<Arc<UsageTracker>>,
    pricing: Arc<PricingTable>,
}

impl UsageTracker {
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            parent: None,
            pricing,
        }
    }

    /// A tracker whose records also land in `parent` (and its ancestors).
    pub fn child_of(parent: &Arc<UsageTracker>) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            parent: Some(parent.clone()),
            pricing: parent.pricing.clone(),
        }
    }

    /// Record one backend call. A missing provider cost is estimated from pricing.
    pub fn record(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: Option<f64>,
    ) -> ModelUsageSummary {
        let cost_micros = match cost {
            Some(dollars) if dollars.is_finite() && dollars >= 0.0 => {
                (dollars * MICROS_PER_DOLLAR).round() as u64
            }
            Some(dollars) => {
                warn!("ignoring invalid provider cost {} for {}", dollars, model);
                self.pricing
                    .estimate_micros(model, input_tokens, output_tokens)
            }
            None => self
                .pricing
                .estimate_micros(model, input_tokens, output_tokens),
        };
        let delta = ModelUsageSummary {
            total_calls: 1,
            total_input_tokens: input_tokens,
            total_output_tokens: output_tokens,
            total_cost_micros: cost_micros,
        };
        debug!(
            "usage: {} in={} out={} cost_micros={}",
            model, input_tokens, output_tokens, cost_micros
        );
        self.apply(model, &delta);
        delta
    }

    /// Record a response, falling back to `prompt_estimate` and a content-length
    /// estimate when the backend omits token counts.
    pub fn record_response(
        &self,
        model: &str,
        response: &LLMResponse,
        prompt_estimate: u64,
    ) -> ModelUsageSummary {
        let input = response.input_tokens.unwrap_or(prompt_estimate);
        let output = response.output_tokens.unwrap_or_else(|| {
            crate::agent::compaction::estimate_tokens(response.content_str()) as u64
        });
        self.record(model, input, output, response.cost)
    }

    fn apply(&self, model: &str, delta: &ModelUsageSummary) {
        let mut tracker = Some(self);
        while let Some(t) = tracker {
            match t.records.lock() {
                Ok(mut records) => records.entry(model.to_string()).or_default().add(delta),
                Err(poisoned) => {
                    warn!("usage tracker mutex poisoned, recovering");
                    poisoned
                        .into_inner()
                        .entry(model.to_string())
                        .or_default()
                        .add(delta);
                }
            }
            tracker = t.parent.as_deref();
        }
    }

    pub fn summary(&self) -> UsageSummary {
        let records = match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        UsageSummary {
            model_usage_summaries: records,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.summary().total_tokens()
    }

    pub fn total_cost(&self) -> f64 {
        self.summary().total_cost()
    }

    /// First breached ceiling, cost before tokens.
    pub fn check_limits(&self, limits: &UsageLimits) -> Result<(), RlmError> {
        let summary = self.summary();
        if let Some(budget) = limits.cost_budget {
            let spent = summary.total_cost();
            if spent >= budget {
                return Err(RlmError::BudgetExceeded {
                    kind: BudgetKind::Cost { spent, budget },
                });
            }
        }
        if let Some(limit) = limits.token_limit {
            let tokens = summary.total_tokens();
            if tokens >= limit {
                return Err(RlmError::TokenLimitExceeded { tokens, limit });
            }
        }
        Ok(())
    }

    /// Budget left for a child spawned now.
    pub fn remaining(&self, limits: &UsageLimits) -> UsageLimits {
        let summary = self.summary();
        UsageLimits {
            cost_budget: limits
                .cost_budget
                .map(|budget| (budget - summary.total_cost()).max(0.0)),
            token_limit: limits
                .token_limit
                .map(|limit| limit.saturating_sub(summary.total_tokens())),
        }
    }
}
