//! OpenRouter chat completions client with timeout and retry

use super::{ChatCompletion, ChatRequest, ImproveProvider, Improvement, ProviderConfig, ERROR_BODY_LIMIT};
use crate::error::{Error, Result};
use crate::settings::Settings;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Check the selection and return it trimmed.
///
/// Order matters: an empty selection is reported before a length problem.
pub fn validate_input(text: &str, max_chars: usize) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptySelection);
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(Error::TooLong { len, max: max_chars });
    }
    Ok(trimmed)
}

fn truncate_body(body: &str) -> String {
    body.trim().chars().take(ERROR_BODY_LIMIT).collect()
}

/// HTTP client for an OpenAI-compatible chat completions endpoint
pub struct OpenRouterClient {
    config: ProviderConfig,
    client: Client,
}

impl OpenRouterClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Build the payload for a validated selection.
    pub fn build_request(&self, text: &str, settings: &Settings) -> ChatRequest {
        let system = settings
            .system_prompt()
            .unwrap_or(self.config.default_system_prompt.as_str());
        ChatRequest::new(settings.effective_model(), system, text)
    }

    /// One HTTP round trip. Returns the body of a 2xx response.
    async fn send_once(&self, api_key: &str, request: &ChatRequest) -> Result<String> {
        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(url) = &self.config.app_url {
            builder = builder.header("HTTP-Referer", url);
        }
        if let Some(title) = &self.config.app_title {
            builder = builder.header("X-Title", title);
        }

        let round_trip = async {
            let response = builder.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<(StatusCode, String), reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(self.config.timeout, round_trip).await {
            Err(_) => return Err(Error::Timeout(self.config.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(Error::Timeout(self.config.timeout)),
            Ok(Err(e)) => return Err(Error::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        if !status.is_success() {
            return Err(Error::Provider {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl ImproveProvider for OpenRouterClient {
    async fn improve(&self, text: &str, settings: &Settings) -> Result<Improvement> {
        let api_key = settings.api_key().ok_or(Error::MissingApiKey)?;
        let text = validate_input(text, self.config.max_input_chars)?;
        let request = self.build_request(text, settings);

        let started = Instant::now();
        let mut attempts = 0;
        let body = loop {
            attempts += 1;
            match self.send_once(api_key, &request).await {
                Ok(body) => break body,
                Err(e) if e.is_retryable() && attempts <= self.config.max_retries => {
                    warn!(
                        "Provider attempt {} failed: {}, retrying in {}ms",
                        attempts,
                        e,
                        self.config.retry_backoff.as_millis()
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => {
                    debug!(attempts, error = %e, "Provider call failed");
                    return Err(e);
                }
            }
        };

        let completion = ChatCompletion::parse(&body)?;
        let content = completion.content().ok_or(Error::EmptyResponse)?;
        if completion.is_truncated() {
            warn!("Provider stopped at its token limit, the improved prompt may be cut off");
        }

        let improvement = Improvement {
            text: content.to_string(),
            model: completion
                .model
                .clone()
                .unwrap_or_else(|| request.model.clone()),
            usage: completion.usage.unwrap_or_default(),
            attempts,
            elapsed: started.elapsed(),
            cached: false,
        };
        info!(
            model = %improvement.model,
            attempts,
            elapsed_ms = improvement.elapsed.as_millis() as u64,
            tokens = improvement.usage.total(),
            "Prompt improved"
        );
        Ok(improvement)
    }

    fn name(&self) -> &str {
        "OpenRouter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_order_and_bounds() {
        assert_eq!(validate_input("   \n", 4000), Err(Error::EmptySelection));
        assert_eq!(validate_input("  hi  ", 4000), Ok("hi"));

        let exact = "a".repeat(4000);
        assert!(validate_input(&format!("  {exact}  "), 4000).is_ok());

        let over = "a".repeat(4001);
        assert_eq!(
            validate_input(&over, 4000),
            Err(Error::TooLong { len: 4001, max: 4000 })
        );
    }

    #[test]
    fn test_length_counts_characters() {
        let text = "é".repeat(4000);
        assert!(validate_input(&text, 4000).is_ok());
    }

    #[test]
    fn test_build_request_defaults() {
        let client = OpenRouterClient::new(ProviderConfig::default());
        let request = client.build_request("make this better", &Settings::default());
        assert_eq!(request.model, "openrouter/auto");
        assert_eq!(request.messages[0].content, crate::api::DEFAULT_SYSTEM_PROMPT);
        assert_eq!(request.user_text(), Some("make this better"));

        let custom = Settings::default()
            .with_model("openai/gpt-4o-mini")
            .with_system_prompt("Be concise");
        let request = client.build_request("x", &custom);
        assert_eq!(request.model, "openai/gpt-4o-mini");
        assert_eq!(request.messages[0].content, "Be concise");
    }

    #[tokio::test]
    async fn test_missing_key_checked_before_text() {
        let client = OpenRouterClient::new(ProviderConfig::default());
        let result = client.improve("", &Settings::default()).await;
        assert_eq!(result, Err(Error::MissingApiKey));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(2000);
        assert_eq!(truncate_body(&body).len(), ERROR_BODY_LIMIT);
    }
}
