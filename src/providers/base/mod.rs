use crate::errors::OxirlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One completion returned by a backend.
#[derive(Debug, Clone, Default)]
pub struct LLMResponse {
    pub content: Option<String>,
    /// Input token count reported by the provider (if available).
    pub input_tokens: Option<u64>,
    /// Output token count reported by the provider (if available).
    pub output_tokens: Option<u64>,
    /// Dollar cost reported by the provider. When absent the usage tracker
    /// estimates it from configured per-model pricing.
    pub cost: Option<f64>,
}

impl LLMResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Parameters for a chat request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub model: Option<&'a str>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The backend capability: turn a list of chat messages into a completion with
/// token and cost accounting. Provider adapters live outside this crate.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<LLMResponse>;

    /// Chat with automatic retry on transient errors.
    ///
    /// Errors that downcast to a non-retryable [`OxirlmError`] are returned
    /// immediately. Anything else is treated as transient.
    async fn chat_with_retry(
        &self,
        req: ChatRequest<'_>,
        retry_config: Option<RetryConfig>,
    ) -> anyhow::Result<LLMResponse> {
        let config = retry_config.unwrap_or_default();
        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                warn!(
                    "Provider retry attempt {}/{} after error: {}",
                    attempt,
                    config.max_retries,
                    last_error
                        .as_ref()
                        .map(|e: &anyhow::Error| e.to_string())
                        .unwrap_or_default()
                );
            }
            debug!("Sending chat request (attempt {})", attempt);
            let chat_req = ChatRequest {
                messages: req.messages.clone(),
                model: req.model,
                max_tokens: req.max_tokens,
                temperature: req.temperature,
            };
            match self.chat(chat_req).await {
                Ok(response) => {
                    debug!("Chat request succeeded on attempt {}", attempt);
                    return Ok(response);
                }
                Err(e) => {
                    // Check for rate limit with retry_after hint
                    let rate_limit_delay =
                        e.downcast_ref::<OxirlmError>().and_then(|ox| match ox {
                            OxirlmError::RateLimit { retry_after } => *retry_after,
                            _ => None,
                        });
                    let is_transient = e
                        .downcast_ref::<OxirlmError>()
                        .is_none_or(OxirlmError::is_retryable);
                    warn!("Chat request failed on attempt {}: {}", attempt, e);
                    if !is_transient {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < config.max_retries {
                        let delay = if let Some(retry_secs) = rate_limit_delay {
                            debug!("Using retry-after hint: {}s", retry_secs);
                            retry_secs * 1000
                        } else {
                            let base = (config.initial_delay_ms as f64
                                * config.backoff_multiplier.powi(attempt as i32))
                            .min(config.max_delay_ms as f64)
                                as u64;
                            // Add jitter (up to 25% of delay) to avoid thundering herd
                            let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
                            let total = base + jitter;
                            debug!(
                                "Waiting {}ms before retry ({}ms base + {}ms jitter)",
                                total, base, jitter
                            );
                            total
                        };
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("All retry attempts failed")))
    }
}
