//! Agent event bus: pub/sub for state changes and problem reports.

use skein_types::event::{AgentEvent, EventPayload};
use tokio::sync::broadcast;
use tracing::debug;

/// Receiver half of the bus.
pub type EventReceiver = broadcast::Receiver<AgentEvent>;

/// Broadcast bus for engine events.
///
/// Publishing is lossy when no subscriber is attached; the engine never
/// blocks on slow consumers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    /// Publish an event payload.
    pub fn publish(&self, payload: EventPayload) {
        debug!(?payload, "publishing event");
        let _ = self.tx.send(AgentEvent::new(payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EventPayload::ProblemReportReceived {
            thread_id: "t-1".into(),
            code: "issuance-abandoned".into(),
            description: "peer gave up".into(),
        });
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::ProblemReportReceived { thread_id, code, .. } => {
                assert_eq!(thread_id, "t-1");
                assert_eq!(code, "issuance-abandoned");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EventPayload::MessageReceived {
            message_type: "https://didcomm.org/trust-ping/1.0/ping".into(),
            thread_id: "t-2".into(),
            connection_id: None,
        });
    }
}
