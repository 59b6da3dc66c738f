//! prompt-improver - send selected text to an LLM and get a better prompt back
//!
//! This library holds the request lifecycle behind the "Prompt Improver" UI:
//! a single provider call per request, guarded by a cache and a queue.
//!
//! ## Key Features
//!
//! - **Response Cache**: TTL-bounded, FIFO-evicting cache keyed by model, system prompt and normalized text
//! - **Request Queue**: Strict FIFO start order, one request in flight by default, cancellable while waiting
//! - **Provider Client**: OpenRouter chat completions with a per-attempt timeout and one retry on transient failures
//! - **Telemetry**: Success/failure counters, daily buckets and bounded history in the settings store
//! - **Coordinator**: The message contract UI surfaces talk to

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod settings;
pub mod storage;
pub mod telemetry;

pub use api::{ImproveOutcome, ImproveProvider, Improvement, OpenRouterClient, ProviderConfig};
pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use config::{Config, ConfigBuilder};
pub use coordinator::{Coordinator, UiReply, UiRequest};
pub use error::{Error, Result};
pub use queue::{QueueConfig, QueueEvent, RequestMetadata, RequestQueue};
pub use settings::{Settings, SettingsStore};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use telemetry::{TelemetryHandle, TelemetryRecorder, TelemetrySnapshot};
