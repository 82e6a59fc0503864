//! Lease: the right to process one in-flight delivery (spec.md §3 "Lease",
//! GLOSSARY "Ack-id").

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::message::StoredMessage;

/// Allocates a fresh ack-id, unique per delivery attempt (spec.md §9
/// "Ack-id allocation": "a cryptographically random 128-bit id").
pub(crate) fn new_ack_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug)]
pub(crate) struct Lease {
    pub ack_id: String,
    pub message: Arc<StoredMessage>,
    pub subscription: String,
    pub deadline: Instant,
    pub extension_count: u32,
    pub created_at: Instant,
}

impl Lease {
    pub fn new(ack_id: String, message: Arc<StoredMessage>, subscription: String, deadline: Instant) -> Self {
        let now = Instant::now();
        Self {
            ack_id,
            message,
            subscription,
            deadline,
            extension_count: 0,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}
