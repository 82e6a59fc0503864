//! Message types shared by every component (spec.md §3 "StoredMessage").

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use crate::error::Error;

pub const MAX_DATA_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 256;
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 1024;
pub const MAX_ORDERING_KEY_BYTES: usize = 1024;
const RESERVED_ATTRIBUTE_PREFIX: &str = "goog";

/// A message as published by a caller, before the broker assigns it an id.
#[derive(Clone, Debug, Default)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

impl PublishMessage {
    /// Validates per spec.md §4.1 `publish`: oversize payload, malformed
    /// attributes, reserved-prefix keys, and empty/oversize ordering keys all
    /// fail fast with `InvalidArgument`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.data.len() > MAX_DATA_BYTES {
            return Err(Error::invalid_argument(format!(
                "message data of {} bytes exceeds the {} byte limit",
                self.data.len(),
                MAX_DATA_BYTES
            )));
        }
        for (key, value) in &self.attributes {
            if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_BYTES {
                return Err(Error::invalid_argument(format!(
                    "attribute key '{key}' must be 1-{MAX_ATTRIBUTE_KEY_BYTES} bytes"
                )));
            }
            if key.to_ascii_lowercase().starts_with(RESERVED_ATTRIBUTE_PREFIX) {
                return Err(Error::invalid_argument(format!(
                    "attribute key '{key}' uses the reserved '{RESERVED_ATTRIBUTE_PREFIX}*' prefix"
                )));
            }
            if value.len() > MAX_ATTRIBUTE_VALUE_BYTES {
                return Err(Error::invalid_argument(format!(
                    "attribute value for '{key}' exceeds {MAX_ATTRIBUTE_VALUE_BYTES} bytes"
                )));
            }
        }
        if let Some(key) = &self.ordering_key {
            if key.is_empty() || key.len() > MAX_ORDERING_KEY_BYTES {
                return Err(Error::invalid_argument(format!(
                    "ordering key must be 1-{MAX_ORDERING_KEY_BYTES} bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.data.len() + self.attributes.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }
}

/// Identity: server-assigned unique message-id, stable across redeliveries
/// (spec.md §3 "StoredMessage").
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: SystemTime,
    pub publish_instant: Instant,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
}

impl StoredMessage {
    pub fn new(id: String, msg: PublishMessage) -> Self {
        Self {
            id,
            data: msg.data,
            attributes: msg.attributes,
            publish_time: SystemTime::now(),
            publish_instant: Instant::now(),
            ordering_key: msg.ordering_key,
            delivery_attempt: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len() + self.attributes.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
    }

    /// Builds the next delivery attempt of this message (spec.md §3
    /// invariant 4: "expiry requeues the StoredMessage and increments its
    /// delivery-attempt counter"). `publish_time`/`publish_instant` are
    /// preserved so retention (invariant 6) is computed from the original
    /// publish, not the redelivery.
    pub fn redelivered(&self) -> Self {
        Self {
            id: self.id.clone(),
            data: self.data.clone(),
            attributes: self.attributes.clone(),
            publish_time: self.publish_time,
            publish_instant: self.publish_instant,
            ordering_key: self.ordering_key.clone(),
            delivery_attempt: self.delivery_attempt + 1,
        }
    }

    pub fn is_retention_expired(&self, retention: std::time::Duration) -> bool {
        self.publish_instant.elapsed() >= retention
    }
}

/// Immutable view delivered to subscribers (spec.md §3 "Ownership" and §6).
/// Does not own the underlying storage and cannot mutate it.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: String,
    pub ack_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: SystemTime,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
}

impl Message {
    pub fn length(&self) -> usize {
        self.data.len()
    }
}
