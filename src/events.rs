//! In-process typed pub/sub between the scheduler, the persistence layer
//! and the WebSocket fan-out.
//!
//! Publish never blocks and never fails: with no subscribers the event is
//! simply dropped. Replay is the store's job, not the bus's.

use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring. Slow subscribers observe `Lagged` and
/// recover from the chunk log.
const BUS_CAPACITY: usize = 1024;

/// Everything that flows between components.
#[derive(Debug, Clone)]
pub enum BusEvent {
    ConversationCreated {
        conversation: Value,
    },
    ConversationUpdated {
        conversation: Value,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    MessageCreated {
        conversation_id: String,
        message: Value,
    },
    StreamingStart {
        session_id: String,
        conversation_id: String,
        agent_id: String,
    },
    StreamingChunk {
        session_id: String,
        conversation_id: String,
        sequence: i64,
        chunk_type: String,
        payload: Value,
    },
    StreamingComplete {
        session_id: String,
        conversation_id: String,
        interrupted: bool,
    },
    StreamingError {
        session_id: String,
        conversation_id: String,
        error: String,
    },
    StreamingCancelled {
        session_id: String,
        conversation_id: String,
    },
    RunCancelled {
        run_id: String,
        conversation_id: Option<String>,
    },
    QueueStatus {
        conversation_id: String,
        length: usize,
    },
}

impl BusEvent {
    /// Session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BusEvent::StreamingStart { session_id, .. }
            | BusEvent::StreamingChunk { session_id, .. }
            | BusEvent::StreamingComplete { session_id, .. }
            | BusEvent::StreamingError { session_id, .. }
            | BusEvent::StreamingCancelled { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Conversation this event belongs to, when it has one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            BusEvent::MessageCreated {
                conversation_id, ..
            }
            | BusEvent::StreamingStart {
                conversation_id, ..
            }
            | BusEvent::StreamingChunk {
                conversation_id, ..
            }
            | BusEvent::StreamingComplete {
                conversation_id, ..
            }
            | BusEvent::StreamingError {
                conversation_id, ..
            }
            | BusEvent::StreamingCancelled {
                conversation_id, ..
            }
            | BusEvent::QueueStatus {
                conversation_id, ..
            } => Some(conversation_id),
            BusEvent::RunCancelled {
                conversation_id, ..
            } => conversation_id.as_deref(),
            _ => None,
        }
    }

    /// Events delivered to every connected client, no subscription needed.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            BusEvent::ConversationCreated { .. }
                | BusEvent::ConversationUpdated { .. }
                | BusEvent::ConversationDeleted { .. }
                | BusEvent::QueueStatus { .. }
        )
    }
}

/// Shared handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Non-blocking publish. A send error only means nobody is listening.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new();
        bus.publish(BusEvent::ConversationDeleted {
            conversation_id: "c1".to_string(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_in_publication_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..3 {
            bus.publish(BusEvent::StreamingChunk {
                session_id: "s1".to_string(),
                conversation_id: "c1".to_string(),
                sequence: i,
                chunk_type: "text".to_string(),
                payload: json!({"i": i}),
            });
        }

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                BusEvent::StreamingChunk { sequence, .. } => assert_eq!(sequence, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn routing_metadata() {
        let chunk = BusEvent::StreamingChunk {
            session_id: "s1".to_string(),
            conversation_id: "c1".to_string(),
            sequence: 0,
            chunk_type: "text".to_string(),
            payload: json!({}),
        };
        assert_eq!(chunk.session_id(), Some("s1"));
        assert_eq!(chunk.conversation_id(), Some("c1"));
        assert!(!chunk.is_broadcast());

        let queue = BusEvent::QueueStatus {
            conversation_id: "c1".to_string(),
            length: 2,
        };
        assert!(queue.is_broadcast());

        let created = BusEvent::ConversationCreated {
            conversation: json!({"id": "c1"}),
        };
        assert!(created.is_broadcast());
        assert_eq!(created.session_id(), None);
    }
}
