//! C3: StreamingPull — the subscriber-side pull loop (spec.md §4.3).
//!
//! Grounded on the teacher's `Subscriber`/`Receiver`/`ReceivedMessage`: a
//! pool of independent pull loops feeding one delivery channel, with
//! `ack()`/`nack()`/`modify_ack_deadline()` hung directly off the delivered
//! message the way the teacher's `ReceivedMessage` does. The teacher drives
//! its loops against a gRPC streaming-pull RPC; this one drives them against
//! `Broker::pull` directly, since there is no wire stream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::{Code, Error};
use crate::lease_manager::{LeaseExtensionSetting, LeaseManager};
use crate::message::Message;

pub const DEFAULT_MAX_STREAMS: usize = 5;
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_PULL_SIZE: usize = 100;
pub const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 1000;
pub const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopBehavior {
    Wait,
    Nack,
}

#[derive(Clone, Debug)]
pub struct CloseOptions {
    pub behavior: StopBehavior,
    pub timeout: Duration,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self {
            behavior: StopBehavior::Wait,
            timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubscriberFlowControl {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub allow_excess_messages: bool,
}

impl Default for SubscriberFlowControl {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
            allow_excess_messages: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamingPullConfig {
    pub max_streams: usize,
    pub pull_interval: Duration,
    pub max_pull_size: usize,
    pub timeout: Duration,
    pub flow_control: SubscriberFlowControl,
    pub close: CloseOptions,
    pub lease_extension: LeaseExtensionSetting,
}

impl Default for StreamingPullConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            pull_interval: DEFAULT_PULL_INTERVAL,
            max_pull_size: DEFAULT_MAX_PULL_SIZE,
            timeout: DEFAULT_STREAMING_TIMEOUT,
            flow_control: SubscriberFlowControl::default(),
            close: CloseOptions::default(),
            lease_extension: LeaseExtensionSetting::default(),
        }
    }
}

struct FlowControl {
    state: Mutex<(usize, usize)>,
    max_messages: usize,
    max_bytes: usize,
}

impl FlowControl {
    fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new((0, 0)),
            max_messages,
            max_bytes,
        }
    }

    fn remaining_messages(&self) -> usize {
        let (messages, _) = *self.state.lock();
        self.max_messages.saturating_sub(messages)
    }

    /// spec.md §4.3: "maxBytes is always enforced — no mid-pull exception";
    /// message count may be exceeded by up to one batch when
    /// `allow_excess` is set.
    fn try_reserve(&self, bytes: usize, allow_excess: bool) -> bool {
        let mut state = self.state.lock();
        let (messages, used_bytes) = *state;
        if used_bytes + bytes > self.max_bytes {
            return false;
        }
        if messages + 1 > self.max_messages && !allow_excess {
            return false;
        }
        *state = (messages + 1, used_bytes + bytes);
        true
    }

    fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.0 = state.0.saturating_sub(1);
        state.1 = state.1.saturating_sub(bytes);
    }
}

#[derive(Default)]
struct OrderingState {
    processing: HashSet<String>,
    queued: HashMap<String, VecDeque<Message>>,
}

struct SharedState {
    broker: Broker,
    subscription: String,
    ordering_enabled: bool,
    flow: FlowControl,
    ordering: Mutex<OrderingState>,
    lease_manager: Mutex<LeaseManager>,
    sender: async_channel::Sender<StreamEvent>,
    self_ref: std::sync::Weak<SharedState>,
}

impl SharedState {
    fn emit(&self, message: Message) {
        let received = ReceivedMessage {
            shared: self.self_arc(),
            message,
        };
        let _ = self.sender.try_send(StreamEvent::Message(received));
    }

    // filled in by StreamingPull::new via Arc::new_cyclic-like pattern; see
    // `SharedState::with_self`.
    fn self_arc(&self) -> Arc<SharedState> {
        self.self_ref.upgrade().expect("SharedState outlives itself")
    }
}

/// Event surfaced to application code (spec.md §9 "EventEmitter delivery →
/// channels": `message` / `error` / `close`).
pub enum StreamEvent {
    Message(ReceivedMessage),
    Error(Error),
    Closed,
}

/// One delivered message, carrying everything needed to settle it (spec.md
/// §6 "message view delivered to subscribers").
pub struct ReceivedMessage {
    shared: Arc<SharedState>,
    message: Message,
}

impl ReceivedMessage {
    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn ack_id(&self) -> &str {
        &self.message.ack_id
    }

    pub fn data(&self) -> &[u8] {
        &self.message.data
    }

    pub fn attributes(&self) -> &std::collections::HashMap<String, String> {
        &self.message.attributes
    }

    pub fn ordering_key(&self) -> Option<&str> {
        self.message.ordering_key.as_deref()
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.message.delivery_attempt
    }

    pub fn length(&self) -> usize {
        self.message.length()
    }

    pub fn ack(&self) -> Result<(), Error> {
        let result = self.shared.broker.ack(&self.message.ack_id);
        self.settle();
        result
    }

    pub fn nack(&self) -> Result<(), Error> {
        let result = self.shared.broker.nack(&self.message.ack_id);
        self.settle();
        result
    }

    pub fn modify_ack_deadline(&self, seconds: u64) -> Result<(), Error> {
        self.shared.broker.modify_ack_deadline(&self.message.ack_id, seconds)
    }

    /// Releases flow control, detaches the lease manager, and — for ordered
    /// keys — promotes the next queued message for the same key (spec.md
    /// §4.3 step 3).
    fn settle(&self) {
        self.shared.lease_manager.lock().done(&self.message.ack_id);
        self.shared.flow.release(self.message.length());
        if let (true, Some(key)) = (self.shared.ordering_enabled, &self.message.ordering_key) {
            let next = {
                let mut ordering = self.shared.ordering.lock();
                match ordering.queued.get_mut(key).and_then(|q| q.pop_front()) {
                    Some(next) => Some(next),
                    None => {
                        ordering.processing.remove(key);
                        None
                    }
                }
            };
            if let Some(next) = next {
                self.shared.emit(next);
            }
        }
    }
}

// `Arc::new_cyclic` needs the weak handle to exist before `SharedState` is
// fully constructed; a plain field holding a `Weak<Self>` does that without
// an extra indirection layer.
impl SharedState {
    fn new_with(
        broker: Broker,
        subscription: String,
        ordering_enabled: bool,
        flow: FlowControl,
        lease_manager: LeaseManager,
        sender: async_channel::Sender<StreamEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| SharedState {
            broker,
            subscription,
            ordering_enabled,
            flow,
            ordering: Mutex::new(OrderingState::default()),
            lease_manager: Mutex::new(lease_manager),
            sender,
            self_ref: weak.clone(),
        })
    }
}

/// Drives delivery for one subscription (spec.md §4.3). Owns the pull-loop
/// tasks, the lease-extension ticker, and the streaming-timeout watchdog.
pub struct StreamingPull {
    shared: Arc<SharedState>,
    config: StreamingPullConfig,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receiver: async_channel::Receiver<StreamEvent>,
}

impl StreamingPull {
    pub fn new(broker: Broker, subscription: impl Into<String>, ordering_enabled: bool, ack_deadline: Duration, exactly_once: bool, config: StreamingPullConfig) -> Self {
        let subscription = subscription.into();
        let (sender, receiver) = async_channel::unbounded();
        let flow = FlowControl::new(config.flow_control.max_messages, config.flow_control.max_bytes);
        let lease_manager = LeaseManager::new(broker.clone(), subscription.clone(), ack_deadline, exactly_once, config.lease_extension.clone());
        let shared = SharedState::new_with(broker, subscription, ordering_enabled, flow, lease_manager, sender);
        Self {
            shared,
            config,
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            receiver,
        }
    }

    pub fn events(&self) -> async_channel::Receiver<StreamEvent> {
        self.receiver.clone()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Starts `max_streams` pull loops plus the lease-extension ticker and
    /// (if enabled) the streaming-timeout watchdog.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for _ in 0..self.config.max_streams {
            tasks.push(self.spawn_pull_loop());
        }
        tasks.push(self.spawn_lease_ticker());
        if !self.config.timeout.is_zero() {
            tasks.push(self.spawn_timeout_watchdog());
        }
    }

    fn spawn_pull_loop(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let paused = self.paused.clone();
        let pull_interval = self.config.pull_interval;
        let max_pull_size = self.config.max_pull_size;
        let allow_excess = self.config.flow_control.allow_excess_messages;
        let ordering_enabled = self.shared.ordering_enabled;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pull_interval) => {}
                }
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                let remaining = shared.flow.remaining_messages();
                let request = if allow_excess { max_pull_size } else { max_pull_size.min(remaining) };
                if request == 0 {
                    continue;
                }
                match shared.broker.pull(&shared.subscription, request, true) {
                    Ok(messages) => {
                        let mut stop_tick = false;
                        for message in messages {
                            if stop_tick {
                                let _ = shared.broker.modify_ack_deadline(&message.ack_id, 0);
                                continue;
                            }
                            if !shared.flow.try_reserve(message.length(), allow_excess) {
                                let _ = shared.broker.modify_ack_deadline(&message.ack_id, 0);
                                stop_tick = true;
                                continue;
                            }
                            shared.lease_manager.lock().register(message.ack_id.clone());
                            if ordering_enabled {
                                if let Some(key) = message.ordering_key.clone() {
                                    let mut ordering = shared.ordering.lock();
                                    if ordering.processing.contains(&key) {
                                        ordering.queued.entry(key).or_default().push_back(message);
                                        continue;
                                    }
                                    ordering.processing.insert(key);
                                }
                            }
                            shared.emit(message);
                        }
                    }
                    Err(e) => {
                        let terminal = e.code() == Code::NotFound || e.code() == Code::FailedPrecondition;
                        let _ = shared.sender.try_send(StreamEvent::Error(e));
                        if terminal {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        })
    }

    fn spawn_lease_ticker(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let tick = shared.lease_manager.lock().tick_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {
                        shared.lease_manager.lock().extend_due();
                    }
                }
            }
        })
    }

    fn spawn_timeout_watchdog(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let deadline = self.config.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(TokioInstant::now() + deadline) => {
                    let _ = shared.sender.try_send(StreamEvent::Error(Error::deadline_exceeded("streaming pull timeout elapsed")));
                    cancel.cancel();
                }
            }
        })
    }

    /// Stops scheduling new pulls; per `behavior`, either waits for
    /// in-flight leases to settle (bounded by `timeout`) or nacks
    /// everything outstanding immediately (spec.md §4.3 "Stop").
    pub async fn stop(&self, close: Option<CloseOptions>) {
        let close = close.unwrap_or_else(|| self.config.close.clone());
        self.cancel.cancel();

        let queued_ack_ids: Vec<String> = {
            let ordering = self.shared.ordering.lock();
            ordering.queued.values().flat_map(|q| q.iter().map(|m| m.ack_id.clone())).collect()
        };
        match close.behavior {
            StopBehavior::Nack => {
                for ack_id in &queued_ack_ids {
                    let _ = self.shared.broker.nack(ack_id);
                }
            }
            StopBehavior::Wait => {
                let deadline = tokio::time::Instant::now() + close.timeout;
                while tokio::time::Instant::now() < deadline {
                    if !self.shared.lease_manager.lock().is_tracked_any() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                for ack_id in &queued_ack_ids {
                    let _ = self.shared.broker.nack(ack_id);
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let _ = self.shared.sender.try_send(StreamEvent::Closed);
    }
}
