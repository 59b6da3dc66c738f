//! Usage telemetry persisted through the key-value store
//!
//! Each recording loads the whole snapshot, applies one change and writes it
//! back. Those cycles are serialized by a single async mutex so overlapping
//! requests never lose updates, whatever the queue's concurrency.
//!
//! The request path never waits on storage: it holds a [`TelemetryHandle`]
//! that hands events to a background writer spawned by
//! [`TelemetryRecorder::spawn_writer`].

mod snapshot;

pub use snapshot::{Counters, HistoryEntry, TelemetrySnapshot, TelemetrySummary, HISTORY_LIMIT};

use crate::storage::{KeyValueStore, StorageError};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Storage key holding the telemetry blob
pub const TELEMETRY_KEY: &str = "telemetry";

/// Events buffered for the writer before new ones are dropped
const TELEMETRY_CHANNEL_SIZE: usize = 1024;

/// Details of a successful request
#[derive(Debug, Clone)]
pub struct SuccessRecord {
    pub response_time: Duration,
    pub tokens_used: u64,
    pub model: String,
}

/// Details of a failed request
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error_type: String,
    pub error_message: String,
}

impl From<&crate::error::Error> for ErrorRecord {
    fn from(err: &crate::error::Error) -> Self {
        Self {
            error_type: err.category().to_string(),
            error_message: err.to_string(),
        }
    }
}

/// One change to the stored snapshot, stamped when it happened
enum Update {
    Start { id: String, at: DateTime<Local> },
    Success { id: String, record: SuccessRecord, at: DateTime<Local> },
    Error { id: String, record: ErrorRecord, at: DateTime<Local> },
}

impl Update {
    fn id(&self) -> &str {
        match self {
            Update::Start { id, .. } | Update::Success { id, .. } | Update::Error { id, .. } => id,
        }
    }
}

enum Command {
    Record(Update),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking sender of telemetry events to the background writer
#[derive(Clone)]
pub struct TelemetryHandle {
    sender: mpsc::Sender<Command>,
}

impl TelemetryHandle {
    pub fn record_start(&self, id: &str) {
        self.send(Update::Start {
            id: id.to_string(),
            at: Local::now(),
        });
    }

    pub fn record_success(&self, id: &str, record: SuccessRecord) {
        self.send(Update::Success {
            id: id.to_string(),
            record,
            at: Local::now(),
        });
    }

    pub fn record_error(&self, id: &str, record: ErrorRecord) {
        self.send(Update::Error {
            id: id.to_string(),
            record,
            at: Local::now(),
        });
    }

    fn send(&self, update: Update) {
        if let Err(e) = self.sender.try_send(Command::Record(update)) {
            match e {
                mpsc::error::TrySendError::Full(Command::Record(update)) => {
                    warn!(id = update.id(), "Telemetry channel full, dropping event");
                }
                mpsc::error::TrySendError::Full(_) => {}
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Telemetry writer stopped");
                }
            }
        }
    }

    /// Wait until every event sent before this call has been written.
    ///
    /// Returns false when the writer is gone.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }
}

/// Records request outcomes for display
#[derive(Clone)]
pub struct TelemetryRecorder {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl TelemetryRecorder {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current persisted snapshot (defaults when nothing is stored yet).
    pub async fn snapshot(&self) -> Result<TelemetrySnapshot, StorageError> {
        let mut values = self.store.get(&[TELEMETRY_KEY]).await?;
        match values.remove(TELEMETRY_KEY) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(TelemetrySnapshot::default()),
        }
    }

    async fn save(&self, snapshot: &TelemetrySnapshot) -> Result<(), StorageError> {
        let value = serde_json::to_value(snapshot)?;
        self.store
            .set(HashMap::from([(TELEMETRY_KEY.to_string(), value)]))
            .await
    }

    async fn update<F>(&self, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut TelemetrySnapshot) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.snapshot().await?;
        apply(&mut snapshot);
        self.save(&snapshot).await
    }

    async fn apply(&self, update: Update) -> Result<(), StorageError> {
        match update {
            Update::Start { id, at } => {
                tracing::trace!(id, "Recording request start");
                self.update(|s| s.apply_start(at)).await
            }
            Update::Success { id, record, at } => {
                self.update(move |s| s.apply_success(id, record, at)).await
            }
            Update::Error { id, record, at } => {
                self.update(move |s| s.apply_error(id, record, at)).await
            }
        }
    }

    /// Spawn the background writer and return the handle feeding it.
    ///
    /// The writer exits once every handle has been dropped.
    pub fn spawn_writer(&self) -> (TelemetryHandle, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(TELEMETRY_CHANNEL_SIZE);
        let recorder = self.clone();

        let task = tokio::spawn(async move {
            debug!("Telemetry writer started");
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Record(update) => {
                        let id = update.id().to_string();
                        if let Err(e) = recorder.apply(update).await {
                            warn!(id = %id, error = %e, "Failed to record telemetry");
                        }
                    }
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Telemetry writer shutting down");
        });

        (TelemetryHandle { sender }, task)
    }

    pub async fn record_start(&self, id: &str) -> Result<(), StorageError> {
        self.apply(Update::Start {
            id: id.to_string(),
            at: Local::now(),
        })
        .await
    }

    pub async fn record_success(&self, id: &str, record: SuccessRecord) -> Result<(), StorageError> {
        self.apply(Update::Success {
            id: id.to_string(),
            record,
            at: Local::now(),
        })
        .await
    }

    pub async fn record_error(&self, id: &str, record: ErrorRecord) -> Result<(), StorageError> {
        self.apply(Update::Error {
            id: id.to_string(),
            record,
            at: Local::now(),
        })
        .await
    }

    /// Percentage of requests that succeeded, 0 when nothing was recorded.
    pub async fn success_rate(&self) -> Result<f64, StorageError> {
        Ok(self.snapshot().await?.success_rate())
    }

    /// Mean response time of successful requests in milliseconds.
    pub async fn average_response_time(&self) -> Result<f64, StorageError> {
        Ok(self.snapshot().await?.average_response_time())
    }

    /// Sum of the daily buckets within `[start, end]`.
    pub async fn date_range_stats(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Counters, StorageError> {
        Ok(self.snapshot().await?.date_range(start, end))
    }

    pub async fn summary(&self) -> Result<TelemetrySummary, StorageError> {
        Ok(self.snapshot().await?.summary())
    }

    /// Replace the stored telemetry with zeroed defaults.
    pub async fn reset(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.save(&TelemetrySnapshot::default()).await
    }
}
