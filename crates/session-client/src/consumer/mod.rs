//! Consumer retry engine.
//!
//! Turns announced remote producers into playable tracks. A consume that
//! loses the race with a producer teardown comes back as "producer not
//! found"; that one failure class is retried with bounded exponential
//! backoff. Everything else is reported once and dropped.
//!
//! Each tracked producer owns a slot holding a cancellation token and a
//! generation. Closure notices and reconciliation cancel the slot, so at
//! most one attempt or scheduled retry exists per producer id.
//!
//! A producer whose attempts ended in failure or abandonment stays failed:
//! later consumes of it are skipped until the id is released or
//! re-announced.

mod backoff;

pub use backoff::RetryPolicy;

use crate::backend::ConsumeBackend;
use crate::errors::ClientError;
use common::error::ErrorCategory;
use common::types::{ConsumerDescriptor, MediaKind};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the event channel handed to the application.
pub const EVENT_BUFFER: usize = 256;

/// How long a closure notice suppresses late consumes of the same id.
pub const RECENTLY_CLOSED_TTL: Duration = Duration::from_secs(10);

/// Local media stack state. Both must hold before anything is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub device_loaded: bool,
    pub recv_transport_ready: bool,
}

impl Readiness {
    pub fn ready() -> Self {
        Self {
            device_loaded: true,
            recv_transport_ready: true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.device_loaded && self.recv_transport_ready
    }
}

/// What the application hears about remote tracks.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    TrackReady {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
        consumer: ConsumerDescriptor,
    },
    TrackEnded {
        peer_id: String,
        producer_id: String,
    },
    /// Retries exhausted or the producer went away while waiting.
    Abandoned { producer_id: String, attempts: u32 },
    /// Non-retryable failure, surfaced once.
    Failed {
        producer_id: String,
        category: ErrorCategory,
        message: String,
    },
}

struct Slot {
    generation: u64,
    peer_id: String,
    cancel: CancellationToken,
    consumer_id: Option<String>,
}

struct Inner {
    backend: Arc<dyn ConsumeBackend>,
    policy: RetryPolicy,
    readiness: watch::Receiver<Readiness>,
    rtp_capabilities: Mutex<serde_json::Value>,
    events: mpsc::Sender<ConsumerEvent>,
    slots: Mutex<HashMap<String, Slot>>,
    recently_closed: Mutex<HashMap<String, Instant>>,
    failed: Mutex<HashSet<String>>,
    next_generation: AtomicU64,
    cancel_token: CancellationToken,
}

/// Consumes remote producers with bounded retries.
#[derive(Clone)]
pub struct ConsumerRetryEngine {
    inner: Arc<Inner>,
}

impl ConsumerRetryEngine {
    /// Build an engine and the receiver for its events.
    pub fn new(
        backend: Arc<dyn ConsumeBackend>,
        policy: RetryPolicy,
        readiness: watch::Receiver<Readiness>,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<ConsumerEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let inner = Inner {
            backend,
            policy,
            readiness,
            rtp_capabilities: Mutex::new(serde_json::Value::Null),
            events,
            slots: Mutex::new(HashMap::new()),
            recently_closed: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
            next_generation: AtomicU64::new(1),
            cancel_token,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Device capabilities sent with every consume request.
    pub fn set_rtp_capabilities(&self, capabilities: serde_json::Value) {
        *self
            .inner
            .rtp_capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capabilities;
    }

    pub fn is_ready(&self) -> bool {
        self.inner.readiness.borrow().is_ready()
    }

    /// Start consuming `producer_id` in the background.
    ///
    /// Returns immediately. A producer that is already tracked, already
    /// failed, or was closed moments ago is left alone.
    ///
    /// # Errors
    ///
    /// `NotReady` when the device or receive transport is not ready.
    #[instrument(skip_all, fields(peer_id = %peer_id, producer_id = %producer_id))]
    pub fn consume(
        &self,
        peer_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<(), ClientError> {
        let readiness = *self.inner.readiness.borrow();
        if !readiness.device_loaded {
            return Err(ClientError::NotReady("device not loaded".to_string()));
        }
        if !readiness.recv_transport_ready {
            return Err(ClientError::NotReady(
                "receive transport not ready".to_string(),
            ));
        }
        if self.inner.is_recently_closed(producer_id) {
            debug!(target: "sc.client.consumer", "Skipping recently closed producer");
            return Ok(());
        }
        if self.has_failed(producer_id) {
            debug!(target: "sc.client.consumer", "Skipping failed producer");
            return Ok(());
        }

        let (generation, cancel) = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(producer_id) {
                debug!(target: "sc.client.consumer", "Producer already tracked");
                return Ok(());
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
            let cancel = self.inner.cancel_token.child_token();
            slots.insert(
                producer_id.to_string(),
                Slot {
                    generation,
                    peer_id: peer_id.to_string(),
                    cancel: cancel.clone(),
                    consumer_id: None,
                },
            );
            (generation, cancel)
        };

        let inner = Arc::clone(&self.inner);
        let attempt = Attempt {
            peer_id: peer_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
            generation,
            cancel,
        };
        tokio::spawn(async move { inner.run(attempt).await });
        Ok(())
    }

    /// Closure notice from the coordinator. Cancels any pending retry,
    /// tears down local playback and blocks late consumes for a while.
    pub async fn on_producer_closed(&self, producer_id: &str) {
        self.inner.mark_closed(producer_id);
        self.release(producer_id).await;
    }

    /// Drop everything held for `producer_id`, including a recorded
    /// failure. Returns whether anything was tracked.
    pub async fn release(&self, producer_id: &str) -> bool {
        self.forget_failure(producer_id);
        let slot = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(producer_id);
        let Some(slot) = slot else {
            return false;
        };
        slot.cancel.cancel();
        if let Some(consumer_id) = slot.consumer_id {
            self.inner.close_consumer(&consumer_id).await;
            self.inner
                .emit(ConsumerEvent::TrackEnded {
                    peer_id: slot.peer_id,
                    producer_id: producer_id.to_string(),
                })
                .await;
        }
        true
    }

    /// Release every tracked producer.
    pub async fn release_all(&self) {
        for producer_id in self.tracked() {
            self.release(&producer_id).await;
        }
    }

    /// Whether the last attempt for `producer_id` failed or was abandoned.
    pub fn has_failed(&self, producer_id: &str) -> bool {
        self.inner
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(producer_id)
    }

    /// Allow `producer_id` to be consumed again, e.g. after the coordinator
    /// announces it anew.
    pub fn forget_failure(&self, producer_id: &str) {
        self.inner
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(producer_id);
    }

    pub fn is_tracking(&self, producer_id: &str) -> bool {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(producer_id)
    }

    /// Consumer id for `producer_id` once playback has started.
    pub fn active_consumer(&self, producer_id: &str) -> Option<String> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(producer_id)
            .and_then(|slot| slot.consumer_id.clone())
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

struct Attempt {
    peer_id: String,
    producer_id: String,
    kind: MediaKind,
    generation: u64,
    cancel: CancellationToken,
}

impl Inner {
    async fn run(&self, attempt: Attempt) {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let capabilities = self
                .rtp_capabilities
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            let result = tokio::select! {
                biased;
                () = attempt.cancel.cancelled() => return,
                result = self.backend.consume(&attempt.producer_id, &capabilities) => result,
            };

            let error = match result {
                Ok(descriptor) => {
                    self.activate(&attempt, descriptor).await;
                    return;
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!(
                    target: "sc.client.consumer",
                    producer_id = %attempt.producer_id,
                    error = %error,
                    "Consume failed"
                );
                self.finish(&attempt);
                self.emit(ConsumerEvent::Failed {
                    producer_id: attempt.producer_id.clone(),
                    category: error.category(),
                    message: error.to_string(),
                })
                .await;
                return;
            }

            if !self.policy.allows_another(attempts) {
                info!(
                    target: "sc.client.consumer",
                    producer_id = %attempt.producer_id,
                    attempts,
                    "Giving up on producer"
                );
                self.abandon(&attempt, attempts).await;
                return;
            }

            let delay = self.policy.delay(attempts - 1);
            debug!(
                target: "sc.client.consumer",
                producer_id = %attempt.producer_id,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Producer not found, retrying"
            );
            tokio::select! {
                biased;
                () = attempt.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if self.is_recently_closed(&attempt.producer_id) {
                debug!(
                    target: "sc.client.consumer",
                    producer_id = %attempt.producer_id,
                    "Producer closed while waiting to retry"
                );
                self.abandon(&attempt, attempts).await;
                return;
            }
        }
    }

    async fn activate(&self, attempt: &Attempt, descriptor: ConsumerDescriptor) {
        if attempt.cancel.is_cancelled() {
            self.close_consumer(&descriptor.consumer_id).await;
            return;
        }

        if let Err(e) = self.backend.resume_consumer(&descriptor.consumer_id).await {
            warn!(
                target: "sc.client.consumer",
                producer_id = %attempt.producer_id,
                consumer_id = %descriptor.consumer_id,
                error = %e,
                "Consumer could not be started"
            );
            self.close_consumer(&descriptor.consumer_id).await;
            self.finish(attempt);
            self.emit(ConsumerEvent::Failed {
                producer_id: attempt.producer_id.clone(),
                category: e.category(),
                message: e.to_string(),
            })
            .await;
            return;
        }

        let current = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get_mut(&attempt.producer_id) {
                Some(slot) if slot.generation == attempt.generation => {
                    slot.consumer_id = Some(descriptor.consumer_id.clone());
                    true
                }
                _ => false,
            }
        };
        if !current {
            // Released while starting
            self.close_consumer(&descriptor.consumer_id).await;
            return;
        }

        debug!(
            target: "sc.client.consumer",
            producer_id = %attempt.producer_id,
            consumer_id = %descriptor.consumer_id,
            "Track ready"
        );
        self.emit(ConsumerEvent::TrackReady {
            peer_id: attempt.peer_id.clone(),
            producer_id: attempt.producer_id.clone(),
            kind: attempt.kind,
            consumer: descriptor,
        })
        .await;
    }

    async fn abandon(&self, attempt: &Attempt, attempts: u32) {
        self.finish(attempt);
        self.emit(ConsumerEvent::Abandoned {
            producer_id: attempt.producer_id.clone(),
            attempts,
        })
        .await;
    }

    /// Remove the slot and record the failure, unless a newer attempt has
    /// taken the slot over.
    fn finish(&self, attempt: &Attempt) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&attempt.producer_id)
            .is_some_and(|slot| slot.generation == attempt.generation)
        {
            slots.remove(&attempt.producer_id);
            self.failed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(attempt.producer_id.clone());
        }
    }

    async fn close_consumer(&self, consumer_id: &str) {
        if let Err(e) = self.backend.close_consumer(consumer_id).await {
            warn!(
                target: "sc.client.consumer",
                consumer_id = %consumer_id,
                error = %e,
                "Failed to close consumer"
            );
        }
    }

    async fn emit(&self, event: ConsumerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: "sc.client.consumer", "Event receiver dropped");
        }
    }

    fn mark_closed(&self, producer_id: &str) {
        let now = Instant::now();
        let mut closed = self
            .recently_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        closed.retain(|_, at| now.duration_since(*at) < RECENTLY_CLOSED_TTL);
        closed.insert(producer_id.to_string(), now);
    }

    fn is_recently_closed(&self, producer_id: &str) -> bool {
        self.recently_closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(producer_id)
            .is_some_and(|at| at.elapsed() < RECENTLY_CLOSED_TTL)
    }
}
