use crate::agent::usage::UsageTracker;
use crate::config::CompactionConfig;
use crate::providers::base::{ChatRequest, LLMProvider, Message, RetryConfig};
use crate::session::Turn;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

const COMPACTION_PROMPT: &str = "Summarize this transcript preserving the facts, decisions and intermediate results needed to continue the task. Keep variable names that hold results in the REPL, values already computed, approaches that failed and why, and what remains to be done.\n\nTask:\n{instruction}\n\nTranscript to summarize:\n{transcript}\n\nWrite a concise summary that a model can continue from. Do not include preamble - just the summary.";

const COMPACTION_MAX_TOKENS: u32 = 2000;
const COMPACTION_TEMPERATURE: f32 = 0.3;
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    // Use char count for better accuracy with non-ASCII text
    text.chars().count() / CHARS_PER_TOKEN_ESTIMATE
}

pub fn estimate_turns_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(|t| estimate_tokens(&t.render())).sum()
}

/// Rendered size of a transcript in characters.
pub fn transcript_chars(turns: &[Turn]) -> usize {
    turns.iter().map(|t| t.render().chars().count()).sum()
}

/// Summarizes a transcript prefix when the prompt approaches the context window.
pub struct TranscriptCompactor {
    provider: Arc<dyn LLMProvider>,
    model: String,
    config: CompactionConfig,
    retry: RetryConfig,
}

impl TranscriptCompactor {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        config: CompactionConfig,
        retry: RetryConfig,
    ) -> Self {
        let model = config.model.clone().unwrap_or_else(|| model.into());
        Self {
            provider,
            model,
            config,
            retry,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether a prompt of `prompt_tokens` is at or above the configured share of the window.
    pub fn should_compact(&self, prompt_tokens: usize) -> bool {
        if !self.config.enabled || self.config.context_window_tokens == 0 {
            return false;
        }
        let ratio = prompt_tokens as f64 / self.config.context_window_tokens as f64;
        ratio >= self.config.threshold_pct
    }

    /// Compact when `fixed_tokens` (system prompt and task) plus the transcript
    /// cross the threshold. Returns whether the transcript changed.
    pub async fn maybe_compact(
        &self,
        instruction: &str,
        turns: &mut Vec<Turn>,
        fixed_tokens: usize,
        tracker: &UsageTracker,
    ) -> Result<bool> {
        let prompt_tokens = fixed_tokens + estimate_turns_tokens(turns);
        if !self.should_compact(prompt_tokens) {
            return Ok(false);
        }
        info!(
            "compaction: prompt ~{} tokens of {} window, summarizing {} turns",
            prompt_tokens,
            self.config.context_window_tokens,
            turns.len().saturating_sub(1)
        );
        self.compact(instruction, turns, tracker).await
    }

    /// Replace every turn but the most recent with one summary turn.
    ///
    /// One backend call. The rendered transcript always gets strictly smaller:
    /// a summary that is not shorter than what it replaces is cut down, and the
    /// transcript is left alone when even that cannot help.
    pub async fn compact(
        &self,
        instruction: &str,
        turns: &mut Vec<Turn>,
        tracker: &UsageTracker,
    ) -> Result<bool> {
        if turns.len() < 2 {
            debug!("compaction: fewer than two turns, nothing to summarize");
            return Ok(false);
        }
        let prefix = &turns[..turns.len() - 1];
        let prefix_chars = transcript_chars(prefix);
        let transcript = prefix
            .iter()
            .map(|t| format!("[iteration {}]\n{}", t.iteration, t.render()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = COMPACTION_PROMPT
            .replace("{instruction}", instruction)
            .replace("{transcript}", &transcript);
        let prompt_estimate = estimate_tokens(&prompt) as u64;

        let response = self
            .provider
            .chat_with_retry(
                ChatRequest {
                    messages: vec![Message::user(prompt)],
                    model: Some(&self.model),
                    max_tokens: COMPACTION_MAX_TOKENS,
                    temperature: COMPACTION_TEMPERATURE,
                },
                Some(self.retry.clone()),
            )
            .await?;
        tracker.record_response(&self.model, &response, prompt_estimate);

        let summary = response.content_str().trim();
        if summary.is_empty() {
            return Err(anyhow::anyhow!("compaction produced empty summary"));
        }

        let last_iteration = prefix.last().map_or(0, |t| t.iteration);
        let mut summary_turn = Turn::summary(last_iteration, summary);
        if summary_turn.render().chars().count() >= prefix_chars {
            let header = Turn::summary(last_iteration, "").render().chars().count();
            let budget = (prefix_chars / 2).saturating_sub(header);
            if budget == 0 {
                debug!("compaction: prefix too small to shrink ({} chars)", prefix_chars);
                return Ok(false);
            }
            let cut = char_byte_index(summary, budget);
            summary_turn = Turn::summary(last_iteration, &summary[..cut]);
        }

        let Some(latest) = turns.pop() else {
            return Ok(false);
        };
        let replaced = turns.len();
        turns.clear();
        turns.push(summary_turn);
        turns.push(latest);
        debug!(
            "compaction complete: {} turns ({} chars) -> summary of {} chars",
            replaced,
            prefix_chars,
            turns[0].render().chars().count()
        );
        Ok(true)
    }
}

/// Byte index of the `n`th char, or the string length.
fn char_byte_index(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
