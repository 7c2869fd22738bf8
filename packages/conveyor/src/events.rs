//! Queue lifecycle events.
//!
//! Events are facts about what happened to a job, published on a bounded
//! broadcast channel. Delivery is at-most-once: slow subscribers drop the
//! oldest events rather than applying backpressure to the hot path.
//! Monitoring and health consume this stream instead of polling the job log.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::retry::ErrorCategory;

/// Facts about the job lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A job was accepted into the log.
    Enqueued {
        queue: String,
        job_id: Uuid,
        kind: String,
        priority: i32,
    },

    /// A worker began executing a job.
    Started {
        queue: String,
        job_id: Uuid,
        kind: String,
        attempt: u32,
    },

    /// A job finished successfully.
    Completed {
        queue: String,
        job_id: Uuid,
        kind: String,
        duration_ms: u64,
    },

    /// A job execution failed.
    Failed {
        queue: String,
        job_id: Uuid,
        kind: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    /// A job was moved to the dead-letter queue.
    DeadLettered {
        queue: String,
        job_id: Uuid,
        kind: String,
        category: ErrorCategory,
        can_retry: bool,
    },

    /// A dead-lettered job was resurrected back onto its queue.
    Resurrected { queue: String, job_id: Uuid },

    /// A pending job was cancelled.
    Cancelled { queue: String, job_id: Uuid },
}

impl QueueEvent {
    /// The queue this event belongs to.
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Enqueued { queue, .. }
            | QueueEvent::Started { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::DeadLettered { queue, .. }
            | QueueEvent::Resurrected { queue, .. }
            | QueueEvent::Cancelled { queue, .. } => queue,
        }
    }
}

/// Broadcast bus for [`QueueEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the stream from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(QueueEvent::Enqueued {
            queue: "tts".to_string(),
            job_id: Uuid::new_v4(),
            kind: "tts".to_string(),
            priority: 5,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.queue(), "tts");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(QueueEvent::Cancelled {
            queue: "q".to_string(),
            job_id: Uuid::new_v4(),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn events_serialize() {
        let event = QueueEvent::Failed {
            queue: "q".to_string(),
            job_id: Uuid::new_v4(),
            kind: "news-index".to_string(),
            error: "ETIMEDOUT".to_string(),
            attempt: 2,
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("will_retry"));
        let _: QueueEvent = serde_json::from_str(&json).unwrap();
    }
}
