//! C2: per-topic client-side batcher (spec.md §4.2).
//!
//! Structurally grounded on the teacher's `Publisher`/`Tasks`/`Awaiter`: a
//! batch accumulates behind count/byte/age triggers, then is handed off to a
//! per-ordering-key worker task (mirroring the teacher's one-task-per-
//! ordering-bucket `Tasks::run_task`) that dispatches it into
//! `Broker::publish` — a direct call rather than a gRPC round trip, but still
//! serialized per key so batches for the same key can never reorder into the
//! broker (spec.md §5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::Error;
use crate::message::PublishMessage;

pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_MILLIS: u64 = 10;
pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 100;
pub const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct BatchingConfig {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub max_age: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
            max_age: Duration::from_millis(DEFAULT_MAX_MILLIS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlowControlConfig {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_outstanding_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_outstanding_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PublisherConfig {
    pub batching: BatchingConfig,
    pub flow_control: FlowControlConfig,
}

/// Future returned by `publish_message` (spec.md §4.2 `publishMessage`).
/// Mirrors the teacher's `Awaiter`.
pub struct Awaiter {
    consumer: oneshot::Receiver<Result<String, Error>>,
}

impl Awaiter {
    fn new(consumer: oneshot::Receiver<Result<String, Error>>) -> Self {
        Self { consumer }
    }

    fn ready(result: Result<String, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx)
    }

    pub async fn get(self, cancel: Option<CancellationToken>) -> Result<String, Error> {
        let result = match cancel {
            Some(cancel) => {
                select! {
                    _ = cancel.cancelled() => return Err(Error::cancelled("publish cancelled")),
                    v = self.consumer => v,
                }
            }
            None => self.consumer.await,
        };
        result.unwrap_or_else(|_| Err(Error::cancelled("publisher shut down")))
    }
}

/// Holds the flow-control admission for one queued message; dropping it
/// (on dispatch completion) releases the corresponding permits back to the
/// semaphores (spec.md §4.2 "release happens when the corresponding broker
/// publish completes").
struct Admission {
    _message: OwnedSemaphorePermit,
    _bytes: OwnedSemaphorePermit,
}

struct PendingMessage {
    message: PublishMessage,
    reply: oneshot::Sender<Result<String, Error>>,
    admission: Admission,
}

struct Batch {
    messages: VecDeque<PendingMessage>,
    bytes: usize,
    generation: u64,
}

impl Batch {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            bytes: 0,
            generation: 0,
        }
    }
}

/// Everything a dispatch worker needs, split out of `Inner` so a worker task
/// holds this instead of the whole `Inner` — otherwise the worker's channel
/// receiver would keep its own sender (reachable only through `Inner`) alive
/// forever, as `Inner` never disappears while a clone of itself is live.
struct DispatchContext {
    broker: Broker,
    topic: String,
    paused: Mutex<HashMap<String, Error>>,
}

struct Inner {
    ctx: Arc<DispatchContext>,
    config: PublisherConfig,
    batches: Mutex<HashMap<Option<String>, Batch>>,
    /// One dispatch worker per ordering key (including the no-key bucket),
    /// spawned lazily. Each worker drains its channel serially, so batches
    /// for the same key reach `Broker::publish` in the order they were
    /// handed off — not in `tokio::spawn` scheduling order (spec.md §5:
    /// "batches for the same key are dispatched serially").
    workers: Mutex<HashMap<Option<String>, async_channel::Sender<Batch>>>,
    message_permits: Arc<Semaphore>,
    byte_permits: Arc<Semaphore>,
}

/// Per-topic publisher (spec.md §4.2). Cheaply `Clone`-able.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub fn new(broker: Broker, topic: impl Into<String>, config: PublisherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                message_permits: Arc::new(Semaphore::new(config.flow_control.max_outstanding_messages)),
                byte_permits: Arc::new(Semaphore::new(config.flow_control.max_outstanding_bytes)),
                ctx: Arc::new(DispatchContext {
                    broker,
                    topic: topic.into(),
                    paused: Mutex::new(HashMap::new()),
                }),
                config,
                batches: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates and admits `msg`, appending it to the batch for its
    /// ordering key (spec.md §4.2). Blocks only on flow-control admission.
    pub async fn publish_message(&self, msg: PublishMessage) -> Awaiter {
        if let Some(key) = &msg.ordering_key {
            if let Some(err) = self.inner.ctx.paused.lock().get(key).cloned() {
                return Awaiter::ready(Err(err));
            }
        }
        if let Err(e) = msg.validate() {
            return Awaiter::ready(Err(e));
        }

        let bytes_wanted = msg.data.len().max(1).min(self.inner.config.flow_control.max_outstanding_bytes) as u32;
        let message_permit = match self.inner.message_permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return Awaiter::ready(Err(Error::cancelled("publisher shut down"))),
        };
        let byte_permit = match self.inner.byte_permits.clone().acquire_many_owned(bytes_wanted).await {
            Ok(p) => p,
            Err(_) => return Awaiter::ready(Err(Error::cancelled("publisher shut down"))),
        };
        let admission = Admission {
            _message: message_permit,
            _bytes: byte_permit,
        };

        let (reply, consumer) = oneshot::channel();
        let key = msg.ordering_key.clone();
        let size = msg.size();
        let ready_batch = {
            let mut batches = self.inner.batches.lock();
            let batch = batches.entry(key.clone()).or_insert_with(Batch::new);
            let was_empty = batch.messages.is_empty();
            batch.bytes += size;
            batch.messages.push_back(PendingMessage { message: msg, reply, admission });
            let triggered =
                batch.messages.len() >= self.inner.config.batching.max_messages || batch.bytes >= self.inner.config.batching.max_bytes;
            batch.generation += if triggered || was_empty { 1 } else { 0 };
            let generation = batch.generation;
            if triggered {
                Some((generation, std::mem::replace(batch, Batch::new())))
            } else {
                if was_empty {
                    self.spawn_flush_timer(key.clone(), generation);
                }
                None
            }
        };
        if let Some((_, batch)) = ready_batch {
            self.enqueue_dispatch(key, batch);
        }
        Awaiter::new(consumer)
    }

    fn spawn_flush_timer(&self, key: Option<String>, generation: u64) {
        let publisher = self.clone();
        let max_age = self.inner.config.batching.max_age;
        tokio::spawn(async move {
            tokio::time::sleep(max_age).await;
            publisher.flush_key_if_current(&key, generation);
        });
    }

    fn flush_key_if_current(&self, key: &Option<String>, generation: u64) {
        let drained = {
            let mut batches = self.inner.batches.lock();
            match batches.get_mut(key) {
                Some(batch) if batch.generation == generation && !batch.messages.is_empty() => {
                    Some(std::mem::replace(batch, Batch::new()))
                }
                _ => None,
            }
        };
        if let Some(batch) = drained {
            self.enqueue_dispatch(key.clone(), batch);
        }
    }

    /// Immediately dispatches every non-empty batch (spec.md §4.2 `flush`).
    pub fn flush(&self) {
        let drained: Vec<(Option<String>, Batch)> = {
            let mut batches = self.inner.batches.lock();
            batches
                .iter_mut()
                .filter(|(_, b)| !b.messages.is_empty())
                .map(|(k, b)| {
                    b.generation += 1;
                    (k.clone(), std::mem::replace(b, Batch::new()))
                })
                .collect()
        };
        for (key, batch) in drained {
            self.enqueue_dispatch(key, batch);
        }
    }

    /// Clears the paused flag for `key` (spec.md §4.2 `resumePublishing`).
    pub fn resume_publishing(&self, key: &str) {
        self.inner.ctx.paused.lock().remove(key);
    }

    /// Hands `batch` to the dispatch worker for `key`, spawning that worker
    /// the first time the key is used.
    fn enqueue_dispatch(&self, key: Option<String>, batch: Batch) {
        let sender = {
            let mut workers = self.inner.workers.lock();
            workers
                .entry(key.clone())
                .or_insert_with(|| Self::spawn_worker(self.inner.ctx.clone(), key))
                .clone()
        };
        let _ = sender.try_send(batch);
    }

    /// One worker per ordering key, grounded on the teacher's one-task-per-
    /// ordering-bucket design (`pubsub/src/publisher.rs`'s `Tasks::run_task`
    /// over a per-key `async_channel`): a single task drains its channel and
    /// awaits each dispatch to completion before taking the next batch, so
    /// batches for the same key never race each other into `Broker::publish`.
    fn spawn_worker(ctx: Arc<DispatchContext>, key: Option<String>) -> async_channel::Sender<Batch> {
        let (tx, rx) = async_channel::unbounded();
        tokio::spawn(async move {
            while let Ok(batch) = rx.recv().await {
                Self::dispatch_batch(&ctx, &key, batch);
            }
        });
        tx
    }

    fn dispatch_batch(ctx: &DispatchContext, key: &Option<String>, batch: Batch) {
        let Batch { messages, .. } = batch;
        let mut payloads = Vec::with_capacity(messages.len());
        let mut replies = Vec::with_capacity(messages.len());
        // Admission permits are dropped (and thus released) when this
        // vector goes out of scope at the end of the function.
        let mut admissions = Vec::with_capacity(messages.len());
        for pending in messages {
            payloads.push(pending.message);
            replies.push(pending.reply);
            admissions.push(pending.admission);
        }
        let result = ctx.broker.publish(&ctx.topic, payloads);
        match result {
            Ok(ids) => {
                for (reply, id) in replies.into_iter().zip(ids.into_iter()) {
                    let _ = reply.send(Ok(id));
                }
            }
            Err(err) => {
                if let Some(key) = key {
                    if !err.code().is_retryable() {
                        ctx.paused.lock().insert(key.clone(), err.clone());
                    }
                }
                for reply in replies {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
        drop(admissions);
    }
}
