//! End-to-end coordinator tests with an in-process provider and in-memory storage.

use async_trait::async_trait;
use prompt_improver::api::TokenUsage;
use prompt_improver::storage::StorageError;
use prompt_improver::telemetry::TELEMETRY_KEY;
use prompt_improver::{
    Config, ConfigBuilder, Coordinator, Error, ImproveProvider, Improvement, KeyValueStore,
    MemoryStore, RequestMetadata, Result, Settings, SettingsStore, UiRequest,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Provider that echoes the text back, optionally holding each call until released
#[derive(Default)]
struct FakeProvider {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeProvider {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImproveProvider for FakeProvider {
    async fn improve(&self, text: &str, settings: &Settings) -> Result<Improvement> {
        settings.api_key().ok_or(Error::MissingApiKey)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(text.to_string());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if text.contains("fail") {
            return Err(Error::Provider {
                status: 503,
                body: "upstream down".into(),
            });
        }

        Ok(Improvement {
            text: format!("Improved: {}", text.trim()),
            model: settings.effective_model().to_string(),
            usage: TokenUsage::new(10, 5),
            attempts: 1,
            elapsed: Duration::from_millis(120),
            cached: false,
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// How [`SlowTelemetryStore`] treats writes of the telemetry blob
#[derive(Clone, Copy)]
enum TelemetryWrites {
    Hang,
    Fail,
}

/// In-memory store whose telemetry writes never complete or always fail
struct SlowTelemetryStore {
    inner: MemoryStore,
    writes: TelemetryWrites,
    attempts: AtomicUsize,
}

impl SlowTelemetryStore {
    fn new(writes: TelemetryWrites) -> Self {
        Self {
            inner: MemoryStore::new(),
            writes,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KeyValueStore for SlowTelemetryStore {
    async fn get(&self, keys: &[&str]) -> std::result::Result<HashMap<String, Value>, StorageError> {
        self.inner.get(keys).await
    }

    async fn set(&self, items: HashMap<String, Value>) -> std::result::Result<(), StorageError> {
        if items.contains_key(TELEMETRY_KEY) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.writes {
                TelemetryWrites::Hang => std::future::pending::<()>().await,
                TelemetryWrites::Fail => {
                    return Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
                }
            }
        }
        self.inner.set(items).await
    }

    async fn remove(&self, keys: &[&str]) -> std::result::Result<(), StorageError> {
        self.inner.remove(keys).await
    }
}

async fn setup_with_store(
    store: Arc<SlowTelemetryStore>,
    provider: Arc<FakeProvider>,
) -> Coordinator {
    let settings = SettingsStore::new(store.clone()).without_env_fallback();
    settings
        .save(&Settings::default().with_api_key("sk-test"))
        .await
        .unwrap();
    Coordinator::new(&config(), provider, store).with_settings_store(settings)
}

async fn setup(config: Config, provider: Arc<FakeProvider>) -> (Coordinator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let settings = SettingsStore::new(store.clone()).without_env_fallback();
    settings
        .save(&Settings::default().with_api_key("sk-test"))
        .await
        .unwrap();

    let coordinator = Coordinator::new(&config, provider, store.clone()).with_settings_store(settings);
    (coordinator, store)
}

fn config() -> Config {
    ConfigBuilder::new().default_model("test/default").build()
}

#[tokio::test]
async fn test_repeat_request_is_served_from_cache() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, _) = setup(config(), provider.clone()).await;

    let first = coordinator.improve("Write a poem").await.unwrap();
    let second = coordinator.improve("  write a POEM ").await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.text, first.text);

    // cache hits are not counted as requests
    assert!(coordinator.flush_telemetry().await);
    let snapshot = coordinator.telemetry().snapshot().await.unwrap();
    assert_eq!(snapshot.counters.total_requests, 1);
    assert_eq!(snapshot.counters.successful_requests, 1);
    assert_eq!(snapshot.counters.total_tokens_used, 15);
    assert_eq!(snapshot.counters.total_response_time_ms, 120);

    let stats = coordinator.cache().map(|c| c.stats()).unwrap();
    assert_eq!((stats.hits, stats.misses, stats.inserts), (1, 1, 1));
    assert!(stats.to_string().contains("Hit rate: 50.0%"));
}

#[tokio::test]
async fn test_no_cache_bypasses_lookup() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, _) = setup(config(), provider.clone()).await;

    coordinator.improve("hello").await.unwrap();
    let fresh = coordinator
        .submit("hello", RequestMetadata::default(), false)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 2);
    assert!(!fresh.cached);
}

#[tokio::test]
async fn test_disabled_cache_always_calls_provider() {
    let provider = Arc::new(FakeProvider::default());
    let config = ConfigBuilder::new().cache_enabled(false).build();
    let (coordinator, _) = setup(config, provider.clone()).await;

    assert!(coordinator.cache().is_none());
    coordinator.improve("hello").await.unwrap();
    coordinator.improve("hello").await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_model_change_misses_cache() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, _) = setup(config(), provider.clone()).await;

    let first = coordinator.improve("hello").await.unwrap();
    assert_eq!(first.model, "test/default");

    coordinator
        .settings()
        .set_field("model", "anthropic/claude-3-haiku")
        .await
        .unwrap();
    let second = coordinator.improve("hello").await.unwrap();

    assert_eq!(provider.calls(), 2);
    assert_eq!(second.model, "anthropic/claude-3-haiku");
    assert!(!second.cached);
}

#[tokio::test]
async fn test_failures_are_recorded_and_not_cached() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, _) = setup(config(), provider.clone()).await;

    let err = coordinator.improve("please fail").await.unwrap_err();
    assert_eq!(err.to_string(), "Provider error 503: upstream down");
    coordinator.improve("please fail").await.unwrap_err();

    assert_eq!(provider.calls(), 2);
    assert_eq!(coordinator.cache().map(|c| c.len()), Some(0));

    assert!(coordinator.flush_telemetry().await);
    let snapshot = coordinator.telemetry().snapshot().await.unwrap();
    assert_eq!(snapshot.counters.total_requests, 2);
    assert_eq!(snapshot.counters.failed_requests, 2);
    assert_eq!(snapshot.errors_by_type.get("provider"), Some(&2));
    assert_eq!(snapshot.success_rate(), 0.0);
}

#[tokio::test]
async fn test_missing_api_key() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, store) = setup(config(), provider.clone()).await;
    SettingsStore::new(store)
        .unset_field("apiKey")
        .await
        .unwrap();

    let reply = coordinator
        .handle_message(UiRequest::ImprovePrompt {
            text: "hello".into(),
            id: None,
        })
        .await;

    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!({"error": "Missing API key. Add your OpenRouter key in the settings."})
    );
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_message_reply_shapes() {
    let provider = Arc::new(FakeProvider::default());
    let (coordinator, _) = setup(config(), provider).await;

    let reply = coordinator
        .handle_message(UiRequest::ImprovePrompt {
            text: "make this better".into(),
            id: Some("req-1".into()),
        })
        .await;
    assert_eq!(
        serde_json::to_value(&reply).unwrap(),
        json!({"result": "Improved: make this better"})
    );

    let reply = coordinator.handle_message(UiRequest::GetQueueStatus).await;
    let status = serde_json::to_value(&reply).unwrap();
    assert_eq!(status["length"], json!(0));
    assert_eq!(status["processing"], json!(false));

    let reply = coordinator
        .handle_message(UiRequest::CancelRequest { id: "req-1".into() })
        .await;
    assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"cancelled": false}));
}

#[tokio::test]
async fn test_cancel_waiting_request() {
    let gate = Arc::new(Semaphore::new(0));
    let provider = Arc::new(FakeProvider::gated(gate.clone()));
    let (coordinator, _) = setup(config(), provider.clone()).await;

    let first = coordinator.submit("first", RequestMetadata::with_id("a"), true);
    let second = coordinator.submit("second", RequestMetadata::with_id("b"), true);
    while provider.calls() == 0 {
        tokio::task::yield_now().await;
    }

    // only the running request has started
    assert_eq!(coordinator.queue_status().in_flight, 1);
    assert_eq!(coordinator.queue().position("b"), Some(2));

    let reply = coordinator
        .handle_message(UiRequest::CancelRequest { id: "b".into() })
        .await;
    assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"cancelled": true}));
    assert!(!coordinator.cancel("a"));

    assert_eq!(second.await.unwrap_err(), Error::Cancelled);

    gate.add_permits(1);
    assert_eq!(first.await.unwrap().text, "Improved: first");
    assert_eq!(provider.seen(), vec!["first".to_string()]);
}

#[tokio::test]
async fn test_requests_start_in_arrival_order() {
    let gate = Arc::new(Semaphore::new(0));
    let provider = Arc::new(FakeProvider::gated(gate.clone()));
    let (coordinator, _) = setup(config(), provider.clone()).await;
    let mut events = coordinator.subscribe();

    let pending: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|text| coordinator.improve(text))
        .collect();
    while provider.calls() == 0 {
        tokio::task::yield_now().await;
    }
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(provider.calls(), 1);

    gate.add_permits(3);
    for (pending, text) in pending.into_iter().zip(["one", "two", "three"]) {
        assert_eq!(pending.await.unwrap().text, format!("Improved: {text}"));
    }
    assert_eq!(provider.seen(), vec!["one", "two", "three"]);

    let mut saw_position_event = false;
    while let Ok(event) = events.try_recv() {
        saw_position_event = true;
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("GET_QUEUE_POSITION"));
    }
    assert!(saw_position_event);
}

#[tokio::test]
async fn test_stalled_telemetry_storage_does_not_hold_requests() {
    let provider = Arc::new(FakeProvider::default());
    let store = Arc::new(SlowTelemetryStore::new(TelemetryWrites::Hang));
    let coordinator = setup_with_store(store.clone(), provider.clone()).await;

    let first = tokio::time::timeout(Duration::from_secs(2), coordinator.improve("one"))
        .await
        .expect("first request stalled on telemetry")
        .unwrap();
    assert_eq!(first.text, "Improved: one");

    // the queue slot is free again even though the writer is still stuck
    let second = tokio::time::timeout(Duration::from_secs(2), coordinator.improve("two"))
        .await
        .expect("second request stalled on telemetry")
        .unwrap();
    assert_eq!(second.text, "Improved: two");
    assert_eq!(provider.calls(), 2);
    assert_eq!(coordinator.queue_status().length, 0);

    while store.attempts.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    let flushed = tokio::time::timeout(Duration::from_millis(50), coordinator.flush_telemetry()).await;
    assert!(flushed.is_err(), "writer should still be blocked");
}

#[tokio::test]
async fn test_failing_telemetry_storage_does_not_fail_requests() {
    let provider = Arc::new(FakeProvider::default());
    let store = Arc::new(SlowTelemetryStore::new(TelemetryWrites::Fail));
    let coordinator = setup_with_store(store.clone(), provider.clone()).await;

    let improvement = coordinator.improve("hello").await.unwrap();
    assert_eq!(improvement.text, "Improved: hello");
    let err = coordinator.improve("please fail").await.unwrap_err();
    assert_eq!(err.category(), "provider");

    // start, success, start, error: every write was attempted and dropped
    assert!(coordinator.flush_telemetry().await);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(
        coordinator.telemetry().snapshot().await.unwrap().counters.total_requests,
        0
    );

    // the cache still works without telemetry
    assert!(coordinator.improve("hello").await.unwrap().cached);
}

#[tokio::test]
async fn test_zero_sweep_interval_from_config() {
    let provider = Arc::new(FakeProvider::default());
    let mut config = config();
    config.cache.sweep_interval_secs = 0;
    let (coordinator, _) = setup(config, provider.clone()).await;

    // let the sweeper task start and tick at least once
    tokio::task::yield_now().await;
    coordinator.improve("hello").await.unwrap();
    assert!(coordinator.improve("hello").await.unwrap().cached);
    assert_eq!(provider.calls(), 1);
}
