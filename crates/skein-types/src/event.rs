//! Event payloads published on the agent event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event emitted by the engine for external subscribers (UI, webhooks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Unique event id.
    pub id: String,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    /// Wrap a payload with a fresh id and timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The kinds of events the engine emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    /// An exchange record committed a state transition.
    StateChanged {
        /// Owning protocol name.
        protocol: String,
        /// The record that transitioned.
        record_id: String,
        /// Exchange thread id.
        thread_id: String,
        /// State before the transition; `None` on record creation.
        previous_state: Option<String>,
        /// State after the transition.
        new_state: String,
    },
    /// A peer signalled a protocol-level failure.
    ProblemReportReceived {
        /// Thread the report is correlated to.
        thread_id: String,
        /// Machine-readable problem code.
        code: String,
        /// Human-readable description.
        description: String,
    },
    /// Outbound delivery gave up after exhausting its retry budget.
    Undeliverable {
        /// Id of the message that could not be delivered.
        message_id: String,
        /// Endpoint that was tried.
        endpoint: String,
        /// Total attempts made.
        attempts: u32,
    },
    /// An inbound message passed validation and dispatch.
    MessageReceived {
        /// Message type URI.
        message_type: String,
        /// Thread id.
        thread_id: String,
        /// Connection the message arrived on, when resolved.
        connection_id: Option<String>,
    },
    /// The mediator queued a forwarded message for a recipient.
    MediationQueued {
        /// Recipient key the message is queued under.
        recipient_key: String,
        /// Queued message id.
        message_id: String,
        /// Delivery strategy of the owning mediation relationship.
        delivery_strategy: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = AgentEvent::new(EventPayload::StateChanged {
            protocol: "connections".into(),
            record_id: "r-1".into(),
            thread_id: "t-1".into(),
            previous_state: Some("request-received".into()),
            new_state: "response-sent".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state-changed");
        assert_eq!(json["new_state"], "response-sent");
    }
}
