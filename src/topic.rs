//! Topic identity and configuration (spec.md §3 "Topic").

use std::collections::HashMap;
use std::time::Duration;

pub const MIN_MESSAGE_RETENTION: Duration = Duration::from_secs(600);
pub const MAX_MESSAGE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
pub const DEFAULT_MESSAGE_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone, Debug)]
pub struct TopicConfig {
    pub labels: HashMap<String, String>,
    pub schema_ref: Option<String>,
    pub message_retention_duration: Duration,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            schema_ref: None,
            message_retention_duration: DEFAULT_MESSAGE_RETENTION,
        }
    }
}

/// Internal registry entry. `subscriptions` is a loose reference by name
/// through the broker registry (spec.md §9 "no cycles in ownership") — this
/// struct never back-points into `Subscription`.
#[derive(Clone, Debug)]
pub(crate) struct TopicEntry {
    pub name: String,
    pub config: TopicConfig,
    pub subscriptions: Vec<String>,
}

impl TopicEntry {
    pub fn new(name: String, config: TopicConfig) -> Self {
        Self {
            name,
            config,
            subscriptions: Vec::new(),
        }
    }
}
