//! TTL-tagged outbound queue (§4.5.2).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Maximum buffered messages while the socket is not open.
pub const QUEUE_CAPACITY: usize = 10;

/// Outbound message types the queue understands. `set_model`,
/// `set_permission_mode`, and `resize` are deliberately absent — they
/// are never queued (§4.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedType {
    /// `input`, 60s TTL.
    Input,
    /// `permission_response`, 30s TTL.
    PermissionResponse,
    /// `user_question_response`, 30s TTL.
    UserQuestionResponse,
    /// `interrupt`, 5s TTL.
    Interrupt,
}

impl QueuedType {
    /// The TTL for this message type.
    #[must_use]
    pub fn ttl(self) -> Duration {
        match self {
            QueuedType::Input => Duration::from_secs(60),
            QueuedType::PermissionResponse | QueuedType::UserQuestionResponse => {
                Duration::from_secs(30)
            }
            QueuedType::Interrupt => Duration::from_secs(5),
        }
    }

    /// Maps an outbound message's wire `type` onto a queued kind, or
    /// `None` if that type is never queued — `set_model`,
    /// `set_permission_mode`, and `resize` fall through here, not by
    /// special-casing a skip list but because no variant exists for them.
    #[must_use]
    pub fn for_message_type(message_type: &str) -> Option<Self> {
        match message_type {
            "input" => Some(QueuedType::Input),
            "permission_response" => Some(QueuedType::PermissionResponse),
            "user_question_response" => Some(QueuedType::UserQuestionResponse),
            "interrupt" => Some(QueuedType::Interrupt),
            _ => None,
        }
    }
}

/// One buffered outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Message type, determining its TTL.
    pub kind: QueuedType,
    /// Serialized payload to send once drained.
    pub payload: String,
    /// When this message was enqueued.
    pub enqueued_at: Instant,
}

/// FIFO, capacity-bounded, TTL-aware outbound buffer.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    /// Build an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }

    /// Current length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Enqueue `payload` tagged `kind` at `now`. Returns `false` (and
    /// leaves the queue unchanged) if already at [`QUEUE_CAPACITY`] —
    /// the distinguishable failure the client-side `sendX` API surfaces
    /// to the UI (§7 Queue overflow).
    pub fn enqueue(&mut self, kind: QueuedType, payload: String, now: Instant) -> bool {
        if self.messages.len() >= QUEUE_CAPACITY {
            return false;
        }
        self.messages.push_back(QueuedMessage {
            kind,
            payload,
            enqueued_at: now,
        });
        true
    }

    /// Drain the queue at time `now`: messages whose `enqueued_at + ttl
    /// < now` are dropped, survivors (including ones expiring exactly at
    /// `now`) are returned in FIFO order, and the queue is empty
    /// afterward regardless (§4.5.2, §8 property 1).
    pub fn drain(&mut self, now: Instant) -> Vec<QueuedMessage> {
        let survivors = self
            .messages
            .drain(..)
            .filter(|m| now.duration_since(m.enqueued_at) <= m.kind.ttl())
            .collect();
        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_up_to_capacity_then_rejects() {
        let mut queue = OutboundQueue::new();
        let now = Instant::now();
        for i in 0..QUEUE_CAPACITY {
            assert!(queue.enqueue(QueuedType::Input, format!("m{i}"), now));
        }
        assert_eq!(queue.len(), QUEUE_CAPACITY);
        assert!(!queue.enqueue(QueuedType::Input, "overflow".to_string(), now));
        assert_eq!(queue.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn drain_drops_expired_and_keeps_order() {
        let mut queue = OutboundQueue::new();
        let t0 = Instant::now();
        queue.enqueue(QueuedType::Interrupt, "i1".to_string(), t0);
        queue.enqueue(QueuedType::Input, "in1".to_string(), t0);
        queue.enqueue(QueuedType::Input, "in2".to_string(), t0);

        // Past the 5s interrupt TTL but within the 60s input TTL.
        let later = t0 + Duration::from_secs(10);
        let survivors = queue.drain(later);

        let payloads: Vec<&str> = survivors.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["in1", "in2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_always_empties_the_queue() {
        let mut queue = OutboundQueue::new();
        let now = Instant::now();
        queue.enqueue(QueuedType::Input, "m".to_string(), now);
        queue.drain(now + Duration::from_secs(1000));
        assert!(queue.is_empty());
    }

    #[test]
    fn excluded_message_types_never_map_to_a_queued_kind() {
        assert_eq!(QueuedType::for_message_type("set_model"), None);
        assert_eq!(QueuedType::for_message_type("set_permission_mode"), None);
        assert_eq!(QueuedType::for_message_type("resize"), None);
        assert!(QueuedType::for_message_type("input").is_some());
    }
}
