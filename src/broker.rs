//! C1: the singleton message router (spec.md §4.1).
//!
//! Single point of truth for topics, subscriptions, pending and in-flight
//! messages. All mutation of the message graph crosses this boundary. A
//! top-level `RwLock` guards the registry maps; each subscription's queue has
//! its own `Mutex` (spec.md §5: "a single reader-writer lock over the entire
//! subscription map is acceptable... but per-subscription locking is
//! preferred" — this crate does both, coarse for the registry, fine for the
//! queues).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{Code, Error};
use crate::lease::{new_ack_id, new_message_id, Lease};
use crate::message::{Message, PublishMessage, StoredMessage};
use crate::subscription::{SubscriptionConfig, SubscriptionEntry};
use crate::topic::{TopicConfig, TopicEntry};

const ACK_ID_GC_AGE: Duration = Duration::from_secs(10 * 60);

/// Why an ack-id no longer routes to a live lease (spec.md §8 invariant 4,
/// §7 error taxonomy).
#[derive(Clone, Debug)]
enum AckRoute {
    /// Routes to `subscription`; the lease may or may not still be present
    /// there (it can have been acked/nacked/expired concurrently).
    Active(String),
    /// The owning subscription was unregistered while the lease was held.
    Gone,
    /// Terminated (acked, DLQ-routed, or the message dropped). ack/nack on
    /// this id are no-ops going forward.
    Done,
}

struct AckRouteEntry {
    route: AckRoute,
    recorded_at: Instant,
}

struct DelayedEntry {
    eligible_at: Instant,
    message: StoredMessage,
}

/// Per-subscription runtime state (spec.md §3 "SubscriptionQueue").
pub(crate) struct SubscriptionQueue {
    pub entry: SubscriptionEntry,
    pending: VecDeque<StoredMessage>,
    keyed: HashMap<String, VecDeque<StoredMessage>>,
    delayed: Vec<DelayedEntry>,
    in_flight: HashMap<String, Lease>,
    active_keys: HashSet<String>,
    bytes: usize,
    count: usize,
}

impl SubscriptionQueue {
    fn new(entry: SubscriptionEntry) -> Self {
        Self {
            entry,
            pending: VecDeque::new(),
            keyed: HashMap::new(),
            delayed: Vec::new(),
            in_flight: HashMap::new(),
            active_keys: HashSet::new(),
            bytes: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    fn over_capacity(&self) -> bool {
        self.count >= self.entry.config.max_queue_messages || self.bytes >= self.entry.config.max_queue_bytes
    }

    fn enqueue_new(&mut self, msg: StoredMessage) {
        self.bytes += msg.size();
        self.count += 1;
        match &msg.ordering_key {
            Some(key) => self.keyed.entry(key.clone()).or_default().push_back(msg),
            None => self.pending.push_back(msg),
        }
    }

    fn requeue_front(&mut self, msg: StoredMessage) {
        match &msg.ordering_key {
            Some(key) => self.keyed.entry(key.clone()).or_default().push_front(msg),
            None => self.pending.push_front(msg),
        }
    }

    /// Moves delayed (nack-backoff) messages whose eligibility time has
    /// passed back into the deliverable queues (spec.md §4.1 state machine:
    /// DELAYED → PENDING).
    fn drain_delayed(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (ready, still_delayed): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.delayed).into_iter().partition(|e| e.eligible_at <= now);
        self.delayed = still_delayed;
        for entry in ready {
            self.requeue_front(entry.message);
        }
    }

    fn next_ready_key(&self) -> Option<String> {
        self.keyed
            .iter()
            .find(|(key, queue)| !queue.is_empty() && !self.active_keys.contains(*key))
            .map(|(key, _)| key.clone())
    }

    fn remove_message_accounting(&mut self, msg: &StoredMessage) {
        self.bytes = self.bytes.saturating_sub(msg.size());
        self.count = self.count.saturating_sub(1);
    }

    /// Retention enforcement (spec.md §3 invariant 6): drops PENDING/DELAYED
    /// messages whose retention has elapsed. In-flight leases are left to
    /// finish (messages are not evicted out from under a live lease).
    fn enforce_retention(&mut self, retention: Duration) -> usize {
        let mut dropped = 0;
        let before = self.pending.len();
        self.pending.retain(|m| !m.is_retention_expired(retention));
        dropped += before - self.pending.len();
        for queue in self.keyed.values_mut() {
            let before = queue.len();
            queue.retain(|m| !m.is_retention_expired(retention));
            dropped += before - queue.len();
        }
        let before = self.delayed.len();
        self.delayed.retain(|e| !e.message.is_retention_expired(retention));
        dropped += before - self.delayed.len();
        if dropped > 0 {
            // bytes/count are reconciled by a full recount since dropped
            // messages came from several sources above.
            self.recount();
        }
        dropped
    }

    fn recount(&mut self) {
        let mut bytes = 0;
        let mut count = 0;
        for m in &self.pending {
            bytes += m.size();
            count += 1;
        }
        for q in self.keyed.values() {
            for m in q {
                bytes += m.size();
                count += 1;
            }
        }
        for e in &self.delayed {
            bytes += e.message.size();
            count += 1;
        }
        for lease in self.in_flight.values() {
            bytes += lease.message.size();
            count += 1;
        }
        self.bytes = bytes;
        self.count = count;
    }
}

struct BrokerState {
    topics: HashMap<String, TopicEntry>,
    subscriptions: HashMap<String, Arc<Mutex<SubscriptionQueue>>>,
    ack_routes: HashMap<String, AckRouteEntry>,
}

/// Singleton message router (spec.md §4.1). Cheaply `Clone`-able; clones
/// share the same underlying state, the way the teacher's `Client`/`Topic`
/// wrap a shared connection pool.
#[derive(Clone)]
pub struct Broker {
    state: Arc<RwLock<BrokerState>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BrokerState {
                topics: HashMap::new(),
                subscriptions: HashMap::new(),
                ack_routes: HashMap::new(),
            })),
        }
    }

    // ---- admin: topics ----------------------------------------------------

    pub fn register_topic(&self, name: &str, config: TopicConfig) -> Result<(), Error> {
        if !(crate::topic::MIN_MESSAGE_RETENTION..=crate::topic::MAX_MESSAGE_RETENTION)
            .contains(&config.message_retention_duration)
        {
            return Err(Error::invalid_argument("messageRetentionDuration out of range"));
        }
        let mut state = self.state.write();
        if state.topics.contains_key(name) {
            return Err(Error::already_exists(format!("topic {name} already exists")));
        }
        state.topics.insert(name.to_string(), TopicEntry::new(name.to_string(), config));
        Ok(())
    }

    /// Destroys the topic; subscriptions are detached, not deleted (spec.md
    /// §3 "Topic... destruction detaches subscriptions without deleting
    /// them").
    pub fn unregister_topic(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.write();
        let topic = state
            .topics
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("topic {name} not found")))?;
        for sub_name in &topic.subscriptions {
            if let Some(queue) = state.subscriptions.get(sub_name) {
                queue.lock().entry.detached = true;
            }
        }
        Ok(())
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.state.read().topics.contains_key(name)
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.state.read().topics.keys().cloned().collect()
    }

    // ---- admin: subscriptions ----------------------------------------------

    pub fn register_subscription(&self, name: &str, config: SubscriptionConfig) -> Result<(), Error> {
        config.validate()?;
        let mut state = self.state.write();
        if state.subscriptions.contains_key(name) {
            return Err(Error::already_exists(format!("subscription {name} already exists")));
        }
        let topic = state
            .topics
            .get_mut(&config.topic)
            .ok_or_else(|| Error::not_found(format!("topic {} not found", config.topic)))?;
        topic.subscriptions.push(name.to_string());
        let entry = SubscriptionEntry::new(name.to_string(), config);
        state
            .subscriptions
            .insert(name.to_string(), Arc::new(Mutex::new(SubscriptionQueue::new(entry))));
        Ok(())
    }

    /// Destroys the subscription; every outstanding ack-id on it becomes
    /// `FailedPrecondition` (spec.md §3 "Subscription... destruction
    /// invalidates all outstanding ack-ids on it").
    pub fn unregister_subscription(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.write();
        let queue = state
            .subscriptions
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("subscription {name} not found")))?;
        let topic_name = queue.lock().entry.config.topic.clone();
        if let Some(topic) = state.topics.get_mut(&topic_name) {
            topic.subscriptions.retain(|s| s != name);
        }
        let ack_ids: Vec<String> = queue.lock().in_flight.keys().cloned().collect();
        for ack_id in ack_ids {
            if let Some(route) = state.ack_routes.get_mut(&ack_id) {
                route.route = AckRoute::Gone;
                route.recorded_at = Instant::now();
            }
        }
        Ok(())
    }

    pub fn subscription_exists(&self, name: &str) -> bool {
        self.state.read().subscriptions.contains_key(name)
    }

    pub fn subscription_names(&self) -> Vec<String> {
        self.state.read().subscriptions.keys().cloned().collect()
    }

    pub fn subscription_config(&self, name: &str) -> Result<SubscriptionConfig, Error> {
        let state = self.state.read();
        let queue = state
            .subscriptions
            .get(name)
            .ok_or_else(|| Error::not_found(format!("subscription {name} not found")))?;
        Ok(queue.lock().entry.config.clone())
    }

    fn subscription_handle(&self, name: &str) -> Result<Arc<Mutex<SubscriptionQueue>>, Error> {
        self.state
            .read()
            .subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("subscription {name} not found")))
    }

    // ---- publish ------------------------------------------------------------

    /// Fans `messages` out to every subscription of `topic_name` (spec.md
    /// §4.1 `publish`). Per-subscription capacity overflow drops the message
    /// for that subscription only (logged, not propagated).
    pub fn publish(&self, topic_name: &str, messages: Vec<PublishMessage>) -> Result<Vec<String>, Error> {
        for msg in &messages {
            msg.validate()?;
        }
        let state = self.state.read();
        let topic = state
            .topics
            .get(topic_name)
            .ok_or_else(|| Error::not_found(format!("topic {topic_name} not found")))?;
        let sub_handles: Vec<Arc<Mutex<SubscriptionQueue>>> = topic
            .subscriptions
            .iter()
            .filter_map(|name| state.subscriptions.get(name).cloned())
            .collect();
        drop(state);

        let mut ids = Vec::with_capacity(messages.len());
        for msg in messages {
            let id = new_message_id();
            let stored = StoredMessage::new(id.clone(), msg);
            for handle in &sub_handles {
                let mut queue = handle.lock();
                if queue.entry.detached {
                    continue;
                }
                if queue.over_capacity() {
                    tracing::warn!(
                        subscription = %queue.entry.name,
                        "subscription over capacity ({} msgs / {} bytes), dropping message {}",
                        queue.len(),
                        queue.byte_size(),
                        id
                    );
                    continue;
                }
                queue.enqueue_new(stored.clone());
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Fans a DLQ-routed message into `dlq_topic`'s subscriptions, the way
    /// `publish` does, except the delivery-attempt counter that drove the
    /// routing decision is preserved on the republished copy instead of
    /// being reset to 1 (spec.md §8 scenario 4: the message on the DLQ
    /// topic carries `deliveryAttempt==4`, not a fresh count).
    fn publish_dead_lettered(&self, dlq_topic: &str, original: &StoredMessage, attributes: HashMap<String, String>) -> Result<(), Error> {
        let state = self.state.read();
        let topic = state
            .topics
            .get(dlq_topic)
            .ok_or_else(|| Error::not_found(format!("topic {dlq_topic} not found")))?;
        let sub_handles: Vec<Arc<Mutex<SubscriptionQueue>>> = topic
            .subscriptions
            .iter()
            .filter_map(|name| state.subscriptions.get(name).cloned())
            .collect();
        drop(state);

        let id = new_message_id();
        let mut stored = StoredMessage::new(
            id,
            PublishMessage {
                data: original.data.clone(),
                attributes,
                ordering_key: original.ordering_key.clone(),
            },
        );
        stored.delivery_attempt = original.delivery_attempt;
        for handle in &sub_handles {
            let mut queue = handle.lock();
            if queue.entry.detached || queue.over_capacity() {
                continue;
            }
            queue.enqueue_new(stored.clone());
        }
        Ok(())
    }

    // ---- pull -----------------------------------------------------------------

    /// Produces up to `max_messages` leases atomically for one subscription
    /// (spec.md §4.1 `pull`). Spawns one expiry timer per lease so an
    /// un-acked message is redelivered exactly at its deadline even if no
    /// `LeaseManager` is auto-extending it.
    pub fn pull(&self, subscription_name: &str, max_messages: usize, spawn_expiry: bool) -> Result<Vec<Message>, Error> {
        let handle = self.subscription_handle(subscription_name)?;
        let now = Instant::now();
        let mut delivered = Vec::with_capacity(max_messages);
        let mut new_leases: Vec<(String, Duration)> = Vec::new();

        {
            let mut queue = handle.lock();
            if queue.entry.detached {
                return Err(Error::failed_precondition(format!(
                    "subscription {subscription_name} is detached"
                )));
            }
            queue.drain_delayed(now);
            let ack_deadline = queue.entry.config.ack_deadline;
            let ordering_enabled = queue.entry.config.enable_message_ordering;

            while delivered.len() < max_messages {
                let msg = if let Some(msg) = queue.pending.pop_front() {
                    Some(msg)
                } else if ordering_enabled {
                    match queue.next_ready_key() {
                        Some(key) => queue.keyed.get_mut(&key).and_then(|q| q.pop_front()),
                        None => None,
                    }
                } else {
                    // Ordering disabled: still respect per-key FIFOs but do
                    // not gate on "one in flight per key".
                    let key = queue.keyed.keys().find(|k| !queue.keyed[*k].is_empty()).cloned();
                    match key {
                        Some(key) => queue.keyed.get_mut(&key).and_then(|q| q.pop_front()),
                        None => None,
                    }
                };
                let msg = match msg {
                    Some(m) => m,
                    None => break,
                };
                let ack_id = new_ack_id();
                let deadline = now + ack_deadline;
                if ordering_enabled {
                    if let Some(key) = &msg.ordering_key {
                        queue.active_keys.insert(key.clone());
                    }
                }
                let view = Message {
                    id: msg.id.clone(),
                    ack_id: ack_id.clone(),
                    data: msg.data.clone(),
                    attributes: msg.attributes.clone(),
                    publish_time: msg.publish_time,
                    ordering_key: msg.ordering_key.clone(),
                    delivery_attempt: msg.delivery_attempt,
                };
                queue
                    .in_flight
                    .insert(ack_id.clone(), Lease::new(ack_id.clone(), Arc::new(msg), subscription_name.to_string(), deadline));
                new_leases.push((ack_id.clone(), ack_deadline));
                delivered.push(view);
            }
        }

        if !new_leases.is_empty() {
            let mut state = self.state.write();
            for (ack_id, _) in &new_leases {
                state.ack_routes.insert(
                    ack_id.clone(),
                    AckRouteEntry {
                        route: AckRoute::Active(subscription_name.to_string()),
                        recorded_at: now,
                    },
                );
            }
        }

        if spawn_expiry {
            for (ack_id, deadline) in new_leases {
                self.spawn_lease_timer(subscription_name.to_string(), ack_id, deadline);
            }
        }

        Ok(delivered)
    }

    fn spawn_lease_timer(&self, subscription: String, ack_id: String, initial_deadline: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut wait = initial_deadline;
            loop {
                tokio::time::sleep(wait).await;
                match broker.try_expire(&subscription, &ack_id) {
                    ExpiryOutcome::Expired | ExpiryOutcome::NotFound => break,
                    ExpiryOutcome::Extended(remaining) => wait = remaining,
                }
            }
        });
    }

    fn try_expire(&self, subscription: &str, ack_id: &str) -> ExpiryOutcome {
        let handle = match self.state.read().subscriptions.get(subscription).cloned() {
            Some(h) => h,
            None => return ExpiryOutcome::NotFound,
        };
        let now = Instant::now();
        let mut queue = handle.lock();
        let still_due = match queue.in_flight.get(ack_id) {
            Some(lease) if lease.deadline <= now => true,
            Some(lease) => {
                return ExpiryOutcome::Extended(lease.deadline.saturating_duration_since(now));
            }
            None => return ExpiryOutcome::NotFound,
        };
        if !still_due {
            return ExpiryOutcome::NotFound;
        }
        let lease = queue.in_flight.remove(ack_id).unwrap();
        if let Some(key) = &lease.message.ordering_key {
            queue.active_keys.remove(key);
        }
        self.requeue_or_deadletter_locked(&mut queue, (*lease.message).redelivered());
        drop(queue);
        let mut state = self.state.write();
        state.ack_routes.insert(
            ack_id.to_string(),
            AckRouteEntry {
                route: AckRoute::Done,
                recorded_at: now,
            },
        );
        ExpiryOutcome::Expired
    }

    // ---- ack / nack / modify -------------------------------------------------

    pub fn ack(&self, ack_id: &str) -> Result<(), Error> {
        let subscription = match self.resolve_route(ack_id)? {
            None => return Ok(()), // already terminated: idempotent no-op
            Some(name) => name,
        };
        let handle = self.subscription_handle(&subscription).ok();
        if let Some(handle) = handle {
            let mut queue = handle.lock();
            if let Some(lease) = queue.in_flight.remove(ack_id) {
                if let Some(key) = &lease.message.ordering_key {
                    queue.active_keys.remove(key);
                }
                queue.remove_message_accounting(&lease.message);
            }
        }
        self.mark_done(ack_id);
        Ok(())
    }

    pub fn nack(&self, ack_id: &str) -> Result<(), Error> {
        self.nack_with_backoff_override(ack_id, None)
    }

    /// `modifyAckDeadline(ackId, 0)` is spec'd as equivalent to a zero-backoff
    /// nack (spec.md §4.1).
    pub fn modify_ack_deadline(&self, ack_id: &str, seconds: u64) -> Result<(), Error> {
        if seconds > 600 {
            return Err(Error::invalid_argument("ack deadline seconds must be 0-600"));
        }
        if seconds == 0 {
            return self.nack_with_backoff_override(ack_id, Some(Duration::ZERO));
        }
        let subscription = match self.resolve_route(ack_id)? {
            None => return Ok(()),
            Some(name) => name,
        };
        let handle = self.subscription_handle(&subscription)?;
        let mut queue = handle.lock();
        if let Some(lease) = queue.in_flight.get_mut(ack_id) {
            lease.deadline = Instant::now() + Duration::from_secs(seconds);
            lease.extension_count += 1;
        }
        Ok(())
    }

    fn nack_with_backoff_override(&self, ack_id: &str, backoff_override: Option<Duration>) -> Result<(), Error> {
        let subscription = match self.resolve_route(ack_id)? {
            None => return Ok(()),
            Some(name) => name,
        };
        let handle = self.subscription_handle(&subscription)?;
        let mut queue = handle.lock();
        let lease = match queue.in_flight.remove(ack_id) {
            Some(l) => l,
            None => return Ok(()), // already settled concurrently
        };
        if let Some(key) = &lease.message.ordering_key {
            queue.active_keys.remove(key);
        }
        let next = (*lease.message).redelivered();
        let retry_policy = queue.entry.config.retry_policy.clone();
        let backoff = backoff_override.unwrap_or_else(|| retry_policy.backoff_for_attempt(next.delivery_attempt));
        self.requeue_or_deadletter_with_backoff(&mut queue, next, backoff);
        drop(queue);
        self.mark_done(ack_id);
        Ok(())
    }

    fn requeue_or_deadletter_locked(&self, queue: &mut SubscriptionQueue, next: StoredMessage) {
        let retry_policy = queue.entry.config.retry_policy.clone();
        let backoff = retry_policy.backoff_for_attempt(next.delivery_attempt);
        self.requeue_or_deadletter_with_backoff(queue, next, backoff);
    }

    /// Routes to the DLQ topic once `deliveryAttempt > maxDeliveryAttempts`
    /// (spec.md §3 invariant 5), otherwise requeues into the delayed queue.
    fn requeue_or_deadletter_with_backoff(&self, queue: &mut SubscriptionQueue, next: StoredMessage, backoff: Duration) {
        let max_attempts = queue.entry.config.dead_letter_policy.as_ref().map(|p| p.max_delivery_attempts);
        if let Some(max_attempts) = max_attempts {
            if next.delivery_attempt > max_attempts {
                queue.remove_message_accounting(&next);
                let dlq_topic = queue.entry.config.dead_letter_policy.as_ref().unwrap().dead_letter_topic.clone();
                let mut attrs = next.attributes.clone();
                attrs.insert(
                    "CloudPubSubDeadLetterSourceDeliveryCount".to_string(),
                    next.delivery_attempt.to_string(),
                );
                if self.topic_exists(&dlq_topic) {
                    if let Err(e) = self.publish_dead_lettered(&dlq_topic, &next, attrs) {
                        tracing::warn!("failed to route message {} to dead-letter topic {dlq_topic}: {e}", next.id);
                    }
                } else {
                    tracing::warn!(
                        "dead-letter topic {dlq_topic} does not exist, dropping message {} after {} attempts",
                        next.id,
                        next.delivery_attempt
                    );
                }
                return;
            }
        }
        queue.delayed.push(DelayedEntry {
            eligible_at: Instant::now() + backoff,
            message: next,
        });
    }

    fn resolve_route(&self, ack_id: &str) -> Result<Option<String>, Error> {
        let state = self.state.read();
        match state.ack_routes.get(ack_id) {
            None => Err(Error::invalid_argument(format!("unknown ack id {ack_id}"))),
            Some(entry) => match &entry.route {
                AckRoute::Active(name) => Ok(Some(name.clone())),
                AckRoute::Gone => Err(Error::failed_precondition(format!(
                    "subscription for ack id {ack_id} no longer exists"
                ))),
                AckRoute::Done => Ok(None),
            },
        }
    }

    fn mark_done(&self, ack_id: &str) {
        let mut state = self.state.write();
        state.ack_routes.insert(
            ack_id.to_string(),
            AckRouteEntry {
                route: AckRoute::Done,
                recorded_at: Instant::now(),
            },
        );
    }

    // ---- housekeeping hooks (see housekeeper.rs) ------------------------------

    pub(crate) fn enforce_retention_all(&self) {
        let subs: Vec<Arc<Mutex<SubscriptionQueue>>> = self.state.read().subscriptions.values().cloned().collect();
        for handle in subs {
            let (retention, dropped) = {
                let mut queue = handle.lock();
                let retention = queue.entry.config.message_retention;
                (retention, queue.enforce_retention(retention))
            };
            if dropped > 0 {
                tracing::debug!("retention expired {dropped} messages (>{:?})", retention);
            }
        }
    }

    pub(crate) fn gc_ack_ids(&self, max_age: Duration) {
        let mut state = self.state.write();
        let now = Instant::now();
        state
            .ack_routes
            .retain(|_, entry| matches!(entry.route, AckRoute::Active(_)) || now.duration_since(entry.recorded_at) < max_age);
    }

    pub(crate) fn default_ack_id_gc_age() -> Duration {
        ACK_ID_GC_AGE
    }

    pub(crate) fn warn_on_capacity(&self) {
        let subs = self.state.read().subscriptions.clone();
        for (name, handle) in subs {
            let queue = handle.lock();
            if queue.over_capacity() {
                tracing::warn!(
                    subscription = %name,
                    "subscription queue at {} messages / {} bytes (limits {} / {})",
                    queue.len(),
                    queue.byte_size(),
                    queue.entry.config.max_queue_messages,
                    queue.entry.config.max_queue_bytes
                );
            }
        }
    }

    /// Sweeps leases whose deadline has passed but whose expiry timer never
    /// fired (e.g. the process was busy) — a safety net behind
    /// `spawn_lease_timer` (spec.md §4.5 "orphan lease sweep").
    pub(crate) fn sweep_orphan_leases(&self) {
        let subs: Vec<(String, Arc<Mutex<SubscriptionQueue>>)> =
            self.state.read().subscriptions.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, _) in subs {
            let expired_ack_ids: Vec<String> = {
                let handle = match self.state.read().subscriptions.get(&name).cloned() {
                    Some(h) => h,
                    None => continue,
                };
                let now = Instant::now();
                let queue = handle.lock();
                queue
                    .in_flight
                    .iter()
                    .filter(|(_, lease)| lease.is_expired(now))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for ack_id in expired_ack_ids {
                self.try_expire(&name, &ack_id);
            }
        }
    }
}

enum ExpiryOutcome {
    Expired,
    Extended(Duration),
    NotFound,
}
