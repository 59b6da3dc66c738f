//! User settings read before every provider call

use crate::storage::{KeyValueStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Model used when the user has not picked one
pub const DEFAULT_MODEL: &str = "openrouter/auto";

/// Environment fallback for the API key
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const KEY_API_KEY: &str = "apiKey";
const KEY_MODEL: &str = "model";
const KEY_SYSTEM_PROMPT: &str = "systemPrompt";
const KEY_TYPING_SPEED: &str = "typingSpeed";

const ALL_KEYS: [&str; 4] = [KEY_API_KEY, KEY_MODEL, KEY_SYSTEM_PROMPT, KEY_TYPING_SPEED];

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Settings bundle handed to the provider client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Characters per second for the overlay's typing animation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing_speed: Option<u32>,
}

impl Settings {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// API key, if one is set and non-blank
    pub fn api_key(&self) -> Option<&str> {
        non_blank(self.api_key.as_deref())
    }

    /// Configured model, or [`DEFAULT_MODEL`]
    pub fn effective_model(&self) -> &str {
        non_blank(self.model.as_deref()).unwrap_or(DEFAULT_MODEL)
    }

    /// Custom system prompt, if one is set and non-blank
    pub fn system_prompt(&self) -> Option<&str> {
        non_blank(self.system_prompt.as_deref())
    }

    fn from_values(values: &HashMap<String, Value>) -> Self {
        let text = |key: &str| values.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            api_key: text(KEY_API_KEY),
            model: text(KEY_MODEL),
            system_prompt: text(KEY_SYSTEM_PROMPT),
            // The options page historically stored this as a string
            typing_speed: values.get(KEY_TYPING_SPEED).and_then(|v| match v {
                Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
        }
    }

    fn to_values(&self) -> HashMap<String, Value> {
        let mut values = HashMap::new();
        if let Some(key) = &self.api_key {
            values.insert(KEY_API_KEY.to_string(), Value::from(key.as_str()));
        }
        if let Some(model) = &self.model {
            values.insert(KEY_MODEL.to_string(), Value::from(model.as_str()));
        }
        if let Some(prompt) = &self.system_prompt {
            values.insert(KEY_SYSTEM_PROMPT.to_string(), Value::from(prompt.as_str()));
        }
        if let Some(speed) = self.typing_speed {
            values.insert(KEY_TYPING_SPEED.to_string(), Value::from(speed));
        }
        values
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Reads and writes [`Settings`] through a [`KeyValueStore`]
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    env_fallback: bool,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            env_fallback: true,
        }
    }

    /// Disable the `OPENROUTER_API_KEY` fallback
    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    pub async fn load(&self) -> Result<Settings, SettingsError> {
        let values = self.store.get(&ALL_KEYS).await?;
        let mut settings = Settings::from_values(&values);

        if self.env_fallback && settings.api_key().is_none() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                settings.api_key = Some(key);
            }
        }

        Ok(settings)
    }

    /// Persist every field that is present; absent fields are left untouched.
    pub async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        self.store.set(settings.to_values()).await?;
        Ok(())
    }

    /// Set one field by its storage key (`apiKey`, `model`, ...).
    pub async fn set_field(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = match key {
            KEY_API_KEY | KEY_MODEL | KEY_SYSTEM_PROMPT => Value::from(value),
            KEY_TYPING_SPEED => {
                let speed: u32 = value.trim().parse().map_err(|_| SettingsError::InvalidValue {
                    key: key.to_string(),
                    reason: "expected a whole number".to_string(),
                })?;
                Value::from(speed)
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        };
        self.store
            .set(HashMap::from([(key.to_string(), value)]))
            .await?;
        Ok(())
    }

    /// Remove one field, reverting it to its default.
    pub async fn unset_field(&self, key: &str) -> Result<(), SettingsError> {
        if !ALL_KEYS.contains(&key) {
            return Err(SettingsError::UnknownKey(key.to_string()));
        }
        self.store.remove(&[key]).await?;
        Ok(())
    }
}
