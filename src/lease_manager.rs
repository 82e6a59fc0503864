//! C4: proactive ack-deadline extension for StreamingPull (spec.md §4.4).
//!
//! Grounded on `gwik-google-cloud-rust`'s `DeadlinesTracker`/
//! `LeaseExtensionSetting`: while a subscriber application is still
//! processing a delivered message, the `LeaseManager` keeps calling
//! `Broker::modify_ack_deadline` so the lease never expires out from under
//! it. It never nacks on its own — once `max_extension` is reached it simply
//! stops extending and the lease is left to expire naturally, at which point
//! the Broker's own per-lease timer (see broker.rs) redelivers it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::broker::Broker;

const MAX_EXTENSION_PERIOD: Duration = Duration::from_secs(10 * 60);
const MIN_EXTENSION_PERIOD: Duration = Duration::from_secs(10);
const MIN_EXTENSION_PERIOD_EXACTLY_ONCE: Duration = Duration::from_secs(60);

/// Mirrors the teacher's `LeaseExtensionSetting` (spec.md §4.4 "cumulative
/// `maxExtensionTime`, default 3600s").
#[derive(Debug, Clone)]
pub struct LeaseExtensionSetting {
    /// Total wall-clock time the manager will keep extending a single
    /// lease before giving up on it.
    pub max_extension: Duration,
    pub max_extension_period: Option<Duration>,
    pub min_extension_period: Option<Duration>,
}

impl Default for LeaseExtensionSetting {
    fn default() -> Self {
        Self {
            max_extension: Duration::from_secs(3600),
            max_extension_period: None,
            min_extension_period: None,
        }
    }
}

impl LeaseExtensionSetting {
    fn bounded_period(&self, ack_deadline: Duration, exactly_once: bool) -> Duration {
        let period = match self.max_extension_period {
            Some(max) => ack_deadline.min(max),
            None => ack_deadline,
        };
        let period = period.min(MAX_EXTENSION_PERIOD);
        if let Some(min) = self.min_extension_period {
            period.max(min)
        } else if exactly_once {
            period.max(MIN_EXTENSION_PERIOD_EXACTLY_ONCE)
        } else {
            period.max(MIN_EXTENSION_PERIOD)
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Deadline {
    started_at: Instant,
    gives_up_at: Instant,
}

/// Tracks in-flight leases for one StreamingPull session and schedules their
/// extension (spec.md §4.4 component design). One instance per active
/// streaming-pull loop, not a singleton.
pub struct LeaseManager {
    broker: Broker,
    subscription: String,
    setting: LeaseExtensionSetting,
    ack_deadline: Duration,
    exactly_once: bool,
    deadlines: HashMap<String, Deadline>,
}

impl LeaseManager {
    pub fn new(broker: Broker, subscription: String, ack_deadline: Duration, exactly_once: bool, setting: LeaseExtensionSetting) -> Self {
        Self {
            broker,
            subscription,
            setting,
            ack_deadline,
            exactly_once,
            deadlines: HashMap::new(),
        }
    }

    /// Starts tracking a freshly pulled message. Must be paired with
    /// `done()` once the app acks or nacks it.
    pub fn register(&mut self, ack_id: String) {
        let now = Instant::now();
        self.deadlines.insert(
            ack_id,
            Deadline {
                started_at: now,
                gives_up_at: now + self.setting.max_extension,
            },
        );
    }

    /// Stops tracking an ack-id; called unconditionally from ack/nack paths
    /// so no extension is ever issued after the app has settled the message.
    pub fn done(&mut self, ack_id: &str) {
        self.deadlines.remove(ack_id);
    }

    pub fn is_tracked(&self, ack_id: &str) -> bool {
        self.deadlines.contains_key(ack_id)
    }

    pub fn is_tracked_any(&self) -> bool {
        !self.deadlines.is_empty()
    }

    /// Extends every tracked lease not yet past its `max_extension` budget.
    /// Intended to be called on a fixed tick (spec.md §4.4: "a periodic tick,
    /// shorter than `ackDeadline`").
    pub fn extend_due(&mut self) {
        let now = Instant::now();
        let period = self.setting.bounded_period(self.ack_deadline, self.exactly_once);
        let mut expired = Vec::new();
        let mut to_extend = Vec::new();
        for (ack_id, deadline) in &self.deadlines {
            if now >= deadline.gives_up_at {
                expired.push(ack_id.clone());
            } else {
                to_extend.push(ack_id.clone());
            }
        }
        for ack_id in expired {
            tracing::debug!(subscription = %self.subscription, %ack_id, "lease extension budget exhausted, no longer extending");
            self.deadlines.remove(&ack_id);
        }
        for ack_id in to_extend {
            if let Err(e) = self.broker.modify_ack_deadline(&ack_id, period.as_secs()) {
                tracing::debug!(subscription = %self.subscription, %ack_id, error = %e, "lease extension failed, dropping from tracker");
                self.deadlines.remove(&ack_id);
            }
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.ack_deadline / 2
    }
}
