//! Provider response parsing and the improved-prompt result

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subset of a chat completion response we rely on
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletion {
    /// Parse a raw response body.
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Trimmed content of the first choice, if it has any.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_deref())
            .map(str::trim)
            .filter(|content| !content.is_empty())
    }

    /// Whether the first choice stopped because it hit the token limit.
    pub fn is_truncated(&self) -> bool {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
            == Some("length")
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens in the response
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens used
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Total, falling back to the sum when the provider omitted it
    pub fn total(&self) -> u32 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens.saturating_add(self.completion_tokens)
        }
    }
}

/// A successfully improved prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    /// The improved text
    pub text: String,
    /// Model that produced it
    pub model: String,
    pub usage: TokenUsage,
    /// HTTP attempts made (1 unless a retry happened)
    pub attempts: u32,
    /// Wall time spent on the provider call, retries included
    pub elapsed: Duration,
    /// Whether this came from the response cache
    #[serde(default)]
    pub cached: bool,
}

/// Reply shape for UI surfaces: exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImproveOutcome {
    Success { result: String },
    Failure { error: String },
}

impl From<Result<Improvement>> for ImproveOutcome {
    fn from(outcome: Result<Improvement>) -> Self {
        match outcome {
            Ok(improvement) => ImproveOutcome::Success {
                result: improvement.text,
            },
            Err(e) => ImproveOutcome::Failure {
                error: e.to_string(),
            },
        }
    }
}
