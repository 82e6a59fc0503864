//! Subscription identity and configuration (spec.md §3 "Subscription").

use std::time::Duration;

use crate::error::Error;

pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);

pub const MIN_DELIVERY_ATTEMPTS: u32 = 5;
pub const MAX_DELIVERY_ATTEMPTS: u32 = 100;
pub const DEFAULT_DELIVERY_ATTEMPTS: u32 = 5;

pub const DEFAULT_MAX_QUEUE_MESSAGES: usize = 10_000;
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub minimum_backoff: Duration,
    pub maximum_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            minimum_backoff: DEFAULT_MIN_BACKOFF,
            maximum_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff between `minimum_backoff` and `maximum_backoff`,
    /// grounded on `gwik-google-cloud-rust`'s `ExponentialBackoff` /
    /// `foundation/gax::retry::ExponentialBackoff` pattern.
    pub fn backoff_for_attempt(&self, delivery_attempt: u32) -> Duration {
        let shift = delivery_attempt.saturating_sub(1).min(32);
        let scaled = self.minimum_backoff.as_millis().saturating_mul(1u128 << shift);
        let capped = scaled.min(self.maximum_backoff.as_millis());
        Duration::from_millis(capped as u64)
    }
}

#[derive(Clone, Debug)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: String,
    pub max_delivery_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_DELIVERY_ATTEMPTS..=MAX_DELIVERY_ATTEMPTS).contains(&self.max_delivery_attempts) {
            return Err(Error::invalid_argument(format!(
                "maxDeliveryAttempts must be {MIN_DELIVERY_ATTEMPTS}-{MAX_DELIVERY_ATTEMPTS}, got {}",
                self.max_delivery_attempts
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExpirationPolicy {
    pub ttl: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub ack_deadline: Duration,
    pub enable_message_ordering: bool,
    pub retry_policy: RetryPolicy,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub expiration_policy: ExpirationPolicy,
    pub exactly_once_delivery: bool,
    pub message_retention: Duration,
    pub max_queue_messages: usize,
    pub max_queue_bytes: usize,
}

impl SubscriptionConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ack_deadline: DEFAULT_ACK_DEADLINE,
            enable_message_ordering: false,
            retry_policy: RetryPolicy::default(),
            dead_letter_policy: None,
            expiration_policy: ExpirationPolicy::default(),
            exactly_once_delivery: false,
            message_retention: crate::topic::DEFAULT_MESSAGE_RETENTION,
            max_queue_messages: DEFAULT_MAX_QUEUE_MESSAGES,
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
        }
    }

    /// Validation performed at `registerSubscription` time (spec.md §3,
    /// §9 Open Question: "require explicit validation to reject < 5").
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_ACK_DEADLINE..=MAX_ACK_DEADLINE).contains(&self.ack_deadline) {
            return Err(Error::invalid_argument(format!(
                "ackDeadlineSeconds must be {}-{}, got {}",
                MIN_ACK_DEADLINE.as_secs(),
                MAX_ACK_DEADLINE.as_secs(),
                self.ack_deadline.as_secs()
            )));
        }
        if let Some(policy) = &self.dead_letter_policy {
            policy.validate()?;
        }
        if !(crate::topic::MIN_MESSAGE_RETENTION..=crate::topic::MAX_MESSAGE_RETENTION).contains(&self.message_retention) {
            return Err(Error::invalid_argument("messageRetentionDuration out of range"));
        }
        Ok(())
    }
}

/// Internal registry entry; `detached` marks a subscription whose topic was
/// unregistered (spec.md §4.1 `unregisterTopic`): it accepts no new messages
/// but already-queued messages remain deliverable until retention expires.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionEntry {
    pub name: String,
    pub config: SubscriptionConfig,
    pub detached: bool,
}

impl SubscriptionEntry {
    pub fn new(name: String, config: SubscriptionConfig) -> Self {
        Self {
            name,
            config,
            detached: false,
        }
    }
}
