//! Provider client: turns selected text into an improved prompt via an LLM API

mod client;
mod request;
mod response;

pub use client::{validate_input, OpenRouterClient};
pub use request::{ChatRequest, Message, Role};
pub use response::{ChatCompletion, ImproveOutcome, Improvement, TokenUsage};

use crate::error::Result;
use crate::settings::Settings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat completions endpoint used when none is configured
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

/// System prompt used when the user has not written their own
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert prompt engineer. Rewrite the user's \
prompt so it is clearer, more specific and more effective for a large language model. Keep the \
original intent and language. Reply with the improved prompt only, without commentary.";

/// Longest selection accepted, in characters after trimming
pub const DEFAULT_MAX_INPUT_CHARS: usize = 4000;

/// Longest response body excerpt kept in provider errors
pub const ERROR_BODY_LIMIT: usize = 500;

/// Transport and retry policy for the provider client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Chat completions URL
    pub endpoint: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Extra attempts after the first on transient failures
    pub max_retries: u32,
    /// Fixed pause before each retry
    pub retry_backoff: Duration,
    /// Maximum selection length in characters
    pub max_input_chars: usize,
    /// Fallback system prompt
    pub default_system_prompt: String,
    /// Sent as `HTTP-Referer` for provider attribution
    pub app_url: Option<String>,
    /// Sent as `X-Title` for provider attribution
    pub app_title: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(15),
            max_retries: 1,
            retry_backoff: Duration::from_millis(600),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            app_url: None,
            app_title: Some("Prompt Improver".to_string()),
        }
    }
}

/// Anything that can improve a prompt
#[async_trait]
pub trait ImproveProvider: Send + Sync {
    /// Improve `text` using the user's settings.
    async fn improve(&self, text: &str, settings: &Settings) -> Result<Improvement>;

    /// Provider name for logging
    fn name(&self) -> &str;
}
