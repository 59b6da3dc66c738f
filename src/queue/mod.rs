//! Request queue that serializes provider calls
//!
//! Requests start strictly in arrival order and at most `max_concurrent`
//! executors run at once (one by default). Every live request carries a
//! 1-based position, recomputed whenever a request leaves the queue, and
//! position updates are broadcast to subscribers for UI feedback.

mod event;

pub use event::QueueEvent;

use crate::error::{Error, Result};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Unit of work run when a request reaches the front of the queue
pub type Executor<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Configuration for the request queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Executors allowed to run at the same time
    pub max_concurrent: usize,
    /// Buffered position events per subscriber before lagging
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            event_capacity: 64,
        }
    }
}

/// Lifecycle of a live request; settled requests leave the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
}

/// Caller-supplied details for a new request
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Request id; a random one is generated when absent
    pub id: Option<String>,
    /// Free-form description for logs
    pub label: Option<String>,
}

impl RequestMetadata {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            label: None,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

struct QueuedRequest<T> {
    id: String,
    status: RequestStatus,
    position: usize,
    label: Option<String>,
    enqueued_at: Instant,
    executor: Option<Executor<T>>,
    responder: Option<oneshot::Sender<Result<T>>>,
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Live requests (queued + processing)
    pub length: usize,
    /// Whether any executor is running
    pub processing: bool,
    pub queued: usize,
    pub in_flight: usize,
}

struct State<T> {
    requests: Vec<QueuedRequest<T>>,
    in_flight: usize,
}

impl<T> State<T> {
    fn renumber(&mut self) {
        for (index, request) in self.requests.iter_mut().enumerate() {
            request.position = index + 1;
        }
    }

    fn position_events(&self) -> Vec<QueueEvent> {
        let total = self.requests.len();
        self.requests
            .iter()
            .map(|r| QueueEvent::Position {
                id: r.id.clone(),
                position: r.position,
                total,
            })
            .collect()
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    max_concurrent: usize,
    events: broadcast::Sender<QueueEvent>,
}

/// FIFO request queue with a bounded number of concurrent executors
pub struct RequestQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    requests: Vec::new(),
                    in_flight: 0,
                }),
                max_concurrent: config.max_concurrent.max(1),
                events,
            }),
        }
    }

    // Bookkeeping sections never await or panic midway, so a poisoned lock
    // still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive position updates for queued requests.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Append a request without an outcome channel. Returns its id.
    ///
    /// The outcome is only logged; use [`RequestQueue::add`] to observe it.
    pub fn enqueue<F>(&self, executor: F, metadata: RequestMetadata) -> String
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.push(Box::pin(executor), metadata, None)
    }

    /// Append a request and return a handle that resolves with its outcome.
    ///
    /// The request is queued immediately, before the handle is awaited.
    pub fn add<F>(&self, executor: F, metadata: RequestMetadata) -> Pending<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.push(Box::pin(executor), metadata, Some(tx));
        Pending { id, rx }
    }

    fn push(
        &self,
        executor: Executor<T>,
        metadata: RequestMetadata,
        responder: Option<oneshot::Sender<Result<T>>>,
    ) -> String {
        let id = metadata
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (position, total) = {
            let mut state = self.lock();
            let position = state.requests.len() + 1;
            state.requests.push(QueuedRequest {
                id: id.clone(),
                status: RequestStatus::Queued,
                position,
                label: metadata.label,
                enqueued_at: Instant::now(),
                executor: Some(executor),
                responder,
            });
            (position, state.requests.len())
        };
        debug!(id = %id, position, "Request enqueued");

        self.broadcast(vec![QueueEvent::Position {
            id: id.clone(),
            position,
            total,
        }]);
        self.process();
        id
    }

    /// Start queued requests while a concurrency slot is free.
    fn process(&self) {
        let mut started = Vec::new();
        let events = {
            let mut state = self.lock();
            while state.in_flight < self.shared.max_concurrent {
                let Some(request) = state
                    .requests
                    .iter_mut()
                    .find(|r| r.status == RequestStatus::Queued)
                else {
                    break;
                };
                request.status = RequestStatus::Processing;
                debug!(
                    id = %request.id,
                    label = request.label.as_deref().unwrap_or(""),
                    waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
                    "Request started"
                );
                if let Some(executor) = request.executor.take() {
                    started.push((request.id.clone(), executor));
                }
                state.in_flight += 1;
            }
            if started.is_empty() {
                Vec::new()
            } else {
                state.position_events()
            }
        };

        self.broadcast(events);

        for (id, executor) in started {
            let queue = self.clone();
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(executor).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Internal("request executor panicked".to_string())),
                };
                queue.finish(&id, outcome);
            });
        }
    }

    fn finish(&self, id: &str, outcome: Result<T>) {
        let (responder, events) = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            let index = state
                .requests
                .iter()
                .position(|r| r.id == id && r.status == RequestStatus::Processing);
            let responder = index.and_then(|index| state.requests.remove(index).responder);
            state.renumber();
            (responder, state.position_events())
        };
        self.broadcast(events);

        match &outcome {
            Ok(_) => debug!(id = %id, "Request completed"),
            Err(e) => debug!(id = %id, error = %e, "Request failed"),
        }

        if let Some(responder) = responder {
            // The caller may have stopped waiting; nothing to do then.
            let _ = responder.send(outcome);
        }

        self.process();
    }

    /// Remove a request that has not started yet, failing its caller with
    /// [`Error::Cancelled`]. Running requests are never interrupted.
    pub fn cancel(&self, id: &str) -> bool {
        let (responder, events) = {
            let mut state = self.lock();
            let Some(index) = state
                .requests
                .iter()
                .position(|r| r.id == id && r.status == RequestStatus::Queued)
            else {
                return false;
            };
            let mut request = state.requests.remove(index);
            state.renumber();
            (request.responder.take(), state.position_events())
        };

        debug!(id = %id, "Request cancelled");
        if let Some(responder) = responder {
            let _ = responder.send(Err(Error::Cancelled));
        }
        self.broadcast(events);
        true
    }

    /// Current 1-based position, or `None` once the request has left the queue.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.lock()
            .requests
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.position)
    }

    /// Status of a live request
    pub fn request_status(&self, id: &str) -> Option<RequestStatus> {
        self.lock()
            .requests
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.status)
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        let queued = state
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Queued)
            .count();
        QueueStatus {
            length: state.requests.len(),
            processing: state.in_flight > 0,
            queued,
            in_flight: state.in_flight,
        }
    }

    /// Fail every request that has not started with [`Error::QueueCleared`].
    /// Running requests are left alone.
    pub fn clear(&self) -> usize {
        let (responders, events): (Vec<_>, _) = {
            let mut state = self.lock();
            let (queued, running): (Vec<_>, Vec<_>) = std::mem::take(&mut state.requests)
                .into_iter()
                .partition(|r| r.status == RequestStatus::Queued);
            state.requests = running;
            state.renumber();
            (
                queued.into_iter().map(|mut r| r.responder.take()).collect(),
                state.position_events(),
            )
        };
        self.broadcast(events);

        let cleared = responders.len();
        for responder in responders.into_iter().flatten() {
            let _ = responder.send(Err(Error::QueueCleared));
        }
        if cleared > 0 {
            debug!(cleared, "Queue cleared");
        }
        cleared
    }

    fn broadcast(&self, events: Vec<QueueEvent>) {
        for event in events {
            if let Err(e) = self.shared.events.send(event) {
                // No subscribers is the common case outside the UI host.
                if self.shared.events.receiver_count() > 0 {
                    warn!(error = %e, "Failed to deliver queue position update");
                }
            }
        }
    }
}

/// Outcome of a request submitted with [`RequestQueue::add`]
#[must_use = "the request runs regardless, but its outcome is lost unless awaited"]
pub struct Pending<T> {
    id: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::Cancelled)))
    }
}
