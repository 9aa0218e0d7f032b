//! Buffer for payloads submitted while no channel is open.

use std::collections::VecDeque;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::frame::Payload;

/// Result of [`OutboundQueue::enqueue`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The queue was full and the oldest payload was evicted
    DroppedOldest(Payload),
    /// The queue was full and the new payload was discarded
    Rejected(Payload),
}

/// Ordered, bounded sequence of not-yet-sent payloads.
///
/// A payload leaves the queue only through a successful send in [`OutboundQueue::flush_into`]
/// (or [`OutboundQueue::clear`]).
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Payload>,
    config: QueueConfig,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
        }
    }

    pub fn enqueue(&mut self, payload: Payload) -> Enqueued {
        if self.items.len() < self.config.capacity {
            self.items.push_back(payload);
            return Enqueued::Queued;
        }

        match self.config.overflow {
            OverflowPolicy::DropOldest => {
                let dropped = self.items.pop_front();
                self.items.push_back(payload);
                dropped.map_or(Enqueued::Queued, Enqueued::DroppedOldest)
            }
            OverflowPolicy::RejectNew => Enqueued::Rejected(payload),
        }
    }

    /// Send every queued payload in order.
    ///
    /// `send` hands the payload back on failure; flushing stops there and that payload stays at
    /// the front, followed by the rest in their original order. Returns how many were sent.
    pub fn flush_into<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(Payload) -> Result<(), Payload>,
    {
        let mut sent = 0;
        while let Some(payload) = self.items.pop_front() {
            if let Err(payload) = send(payload) {
                self.items.push_front(payload);
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize, overflow: OverflowPolicy) -> OutboundQueue {
        OutboundQueue::new(QueueConfig::new(capacity, overflow))
    }

    #[test]
    fn flush_preserves_submission_order() {
        let mut queue = queue(8, OverflowPolicy::DropOldest);
        queue.enqueue("a".into());
        queue.enqueue("b".into());
        queue.enqueue("c".into());

        let mut seen = Vec::new();
        let sent = queue.flush_into(|payload| {
            seen.push(payload);
            Ok(())
        });

        let expected: Vec<Payload> = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(sent, 3);
        assert_eq!(seen, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_send_requeues_remainder_in_order() {
        let mut queue = queue(8, OverflowPolicy::DropOldest);
        for payload in ["a", "b", "c", "d"] {
            queue.enqueue(payload.into());
        }

        let mut budget = 2;
        let sent = queue.flush_into(|payload| {
            if budget == 0 {
                return Err(payload);
            }
            budget -= 1;
            Ok(())
        });
        assert_eq!(sent, 2);
        assert_eq!(queue.len(), 2);

        let mut rest = Vec::new();
        queue.flush_into(|payload| {
            rest.push(payload);
            Ok(())
        });
        let expected: Vec<Payload> = vec!["c".into(), "d".into()];
        assert_eq!(rest, expected);
    }

    #[test]
    fn drop_oldest_evicts_front() {
        let mut queue = queue(2, OverflowPolicy::DropOldest);
        queue.enqueue("a".into());
        queue.enqueue("b".into());

        assert_eq!(queue.enqueue("c".into()), Enqueued::DroppedOldest("a".into()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn reject_new_keeps_existing() {
        let mut queue = queue(1, OverflowPolicy::RejectNew);
        assert_eq!(queue.enqueue("a".into()), Enqueued::Queued);

        assert_eq!(queue.enqueue("b".into()), Enqueued::Rejected("b".into()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_empties_queue() {
        let mut queue = queue(4, OverflowPolicy::DropOldest);
        queue.enqueue("a".into());
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }
}
