//! Request lifecycle coordination
//!
//! This module ties the pieces of a single improvement together:
//! - Requests are serialized through the [`RequestQueue`]
//! - Each request consults the [`ResponseCache`] before calling the provider
//! - Outcomes are handed to the telemetry writer without waiting on storage
//! - Successful results are written back into the cache

mod message;

pub use message::{UiReply, UiRequest};

use crate::api::{ImproveProvider, Improvement};
use crate::cache::{spawn_sweeper, ResponseCache};
use crate::config::Config;
use crate::error::Result;
use crate::queue::{Pending, QueueEvent, QueueStatus, RequestMetadata, RequestQueue};
use crate::settings::SettingsStore;
use crate::storage::KeyValueStore;
use crate::telemetry::{ErrorRecord, SuccessRecord, TelemetryHandle, TelemetryRecorder};
use futures_util::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// Everything an executor needs, cloned into each queued request
#[derive(Clone)]
struct RequestContext {
    cache: Option<Arc<ResponseCache<Improvement>>>,
    provider: Arc<dyn ImproveProvider>,
    telemetry: TelemetryHandle,
    settings: SettingsStore,
    default_model: String,
}

impl RequestContext {
    async fn run(self, id: String, text: String, use_cache: bool) -> Result<Improvement> {
        let mut settings = self.settings.load().await?;
        if settings.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
            settings.model = Some(self.default_model.clone());
        }

        if use_cache {
            if let Some(mut hit) = self.cache.as_ref().and_then(|c| c.get(&text, &settings)) {
                debug!(id = %id, "Serving improvement from cache");
                hit.cached = true;
                return Ok(hit);
            }
        }

        self.telemetry.record_start(&id);

        let outcome = self.provider.improve(&text, &settings).await;

        match &outcome {
            Ok(improvement) => {
                let record = SuccessRecord {
                    response_time: improvement.elapsed,
                    tokens_used: u64::from(improvement.usage.total()),
                    model: improvement.model.clone(),
                };
                self.telemetry.record_success(&id, record);
                if let Some(cache) = &self.cache {
                    cache.set(&text, &settings, improvement.clone());
                }
            }
            Err(err) => {
                debug!(id = %id, provider = self.provider.name(), error = %err, "Improvement failed");
                self.telemetry.record_error(&id, ErrorRecord::from(err));
            }
        }

        outcome
    }
}

/// Front door for UI surfaces
pub struct Coordinator {
    context: RequestContext,
    telemetry: TelemetryRecorder,
    queue: RequestQueue<Improvement>,
    sweeper: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Build a coordinator from configuration.
    ///
    /// Must be called inside a Tokio runtime: the cache sweeper and the
    /// telemetry writer are spawned here.
    pub fn new(
        config: &Config,
        provider: Arc<dyn ImproveProvider>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache_config())));
        let sweeper = cache
            .as_ref()
            .map(|c| spawn_sweeper(Arc::clone(c), config.cache_config().sweep_interval));

        // the writer stops by itself once the last queued request drops its handle
        let telemetry = TelemetryRecorder::new(Arc::clone(&store));
        let (handle, _writer) = telemetry.spawn_writer();

        Self {
            context: RequestContext {
                cache,
                provider,
                telemetry: handle,
                settings: SettingsStore::new(store),
                default_model: config.provider.default_model.clone(),
            },
            telemetry,
            queue: RequestQueue::new(config.queue_config()),
            sweeper,
        }
    }

    /// Replace the settings store (e.g. one without the environment fallback).
    pub fn with_settings_store(mut self, settings: SettingsStore) -> Self {
        self.context.settings = settings;
        self
    }

    /// Queue an improvement of `text`.
    pub fn improve(&self, text: impl Into<String>) -> Pending<Improvement> {
        self.submit(text, RequestMetadata::default(), true)
    }

    /// Queue an improvement with explicit metadata, optionally bypassing the cache.
    pub fn submit(
        &self,
        text: impl Into<String>,
        mut metadata: RequestMetadata,
        use_cache: bool,
    ) -> Pending<Improvement> {
        let id = metadata
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let context = self.context.clone();
        let text = text.into();
        self.queue.add(context.run(id, text, use_cache), metadata)
    }

    /// Answer one UI message.
    ///
    /// Improvement requests are enqueued before this returns, so calling it in
    /// arrival order preserves FIFO order even when the replies are awaited
    /// on separate tasks.
    pub fn handle_message(&self, request: UiRequest) -> BoxFuture<'static, UiReply> {
        match request {
            UiRequest::ImprovePrompt { text, id } => {
                let metadata = RequestMetadata {
                    id,
                    label: Some("ui".to_string()),
                };
                let pending = self.submit(text, metadata, true);
                async move { UiReply::Outcome(pending.await.into()) }.boxed()
            }
            UiRequest::CancelRequest { id } => future::ready(UiReply::Cancelled {
                cancelled: self.queue.cancel(&id),
            })
            .boxed(),
            UiRequest::GetQueueStatus => future::ready(UiReply::Status(self.queue.status())).boxed(),
        }
    }

    /// Cancel a request that has not started yet.
    pub fn cancel(&self, id: &str) -> bool {
        self.queue.cancel(id)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Queue position updates
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn queue(&self) -> &RequestQueue<Improvement> {
        &self.queue
    }

    pub fn cache(&self) -> Option<&ResponseCache<Improvement>> {
        self.context.cache.as_deref()
    }

    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Wait for telemetry recorded so far to reach storage.
    pub async fn flush_telemetry(&self) -> bool {
        self.context.telemetry.flush().await
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.context.settings
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
