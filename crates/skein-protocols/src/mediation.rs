//! Coordinate-mediation protocol: shared wire DTOs, the transition
//! table, and the recipient side (the agent whose inbound traffic a
//! mediator routes).
//!
//! The mediator side, which owns the routing queue, lives in the
//! `skein-mediator` crate and reuses the DTOs and table declared here.

use serde::{Deserialize, Serialize};
use skein_engine::{
    EventBus, Exchange, FailurePolicy, InboundContext, MessageHandler, ThreadLocks,
    TransitionTable,
};
use skein_store::RecordStore;
use skein_types::message::MessageTypeUri;
use skein_types::records::{MediationRecord, MediationRole, MediationState};
use skein_types::{OutboundMessage, ProblemReport, SkeinError, SkeinResult, WireMessage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Mediation request.
pub const TYPE_MEDIATE_REQUEST: &str =
    "https://didcomm.org/coordinate-mediation/1.0/mediate-request";
/// Mediation grant.
pub const TYPE_MEDIATE_GRANT: &str = "https://didcomm.org/coordinate-mediation/1.0/mediate-grant";
/// Mediation denial.
pub const TYPE_MEDIATE_DENY: &str = "https://didcomm.org/coordinate-mediation/1.0/mediate-deny";
/// Keylist update.
pub const TYPE_KEYLIST_UPDATE: &str =
    "https://didcomm.org/coordinate-mediation/1.0/keylist-update";
/// Keylist update response.
pub const TYPE_KEYLIST_UPDATE_RESPONSE: &str =
    "https://didcomm.org/coordinate-mediation/1.0/keylist-update-response";
/// Protocol-scoped problem report.
pub const TYPE_PROBLEM_REPORT: &str =
    "https://didcomm.org/coordinate-mediation/1.0/problem-report";

/// Forward: deposit an encrypted payload for a mediated recipient.
pub const TYPE_FORWARD: &str = "https://didcomm.org/routing/1.0/forward";

/// Batch pickup request.
pub const TYPE_BATCH_PICKUP: &str = "https://didcomm.org/messagepickup/1.0/batch-pickup";
/// Batch of queued messages.
pub const TYPE_BATCH: &str = "https://didcomm.org/messagepickup/1.0/batch";
/// Acknowledgment of delivered message ids.
pub const TYPE_MESSAGES_RECEIVED: &str =
    "https://didcomm.org/messagepickup/1.0/messages-received";

/// Message kinds driving the mediation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationKind {
    /// Mediation request.
    Request,
    /// Grant.
    Grant,
    /// Denial.
    Deny,
}

impl fmt::Display for MediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Grant => "grant",
            Self::Deny => "deny",
        })
    }
}

/// The mediation transition table. Grant/deny is one-shot and terminal;
/// duplicate grant or deny deliveries are silent no-ops.
pub fn mediation_table() -> TransitionTable<MediationState, MediationKind, MediationRole> {
    use MediationKind as K;
    use MediationRole::{Mediator, Recipient};
    use MediationState as S;

    TransitionTable::new("coordinate-mediation")
        .creates(K::Request, Mediator, S::Requested)
        .edge(S::Requested, K::Grant, Mediator, S::Granted)
        .edge(S::Requested, K::Deny, Mediator, S::Denied)
        .edge(S::Requested, K::Grant, Recipient, S::Granted)
        .edge(S::Requested, K::Deny, Recipient, S::Denied)
        .ignores(S::Granted, K::Grant)
        .ignores(S::Denied, K::Deny)
        .terminal(S::Granted)
        .terminal(S::Denied)
}

/// Mediation grant body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediateGrant {
    /// Mediator endpoint peers should send to.
    pub endpoint: String,
    /// Mediator routing keys, outermost last.
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

/// Keylist update action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeylistAction {
    /// Add the key to the keylist.
    Add,
    /// Remove the key from the keylist.
    Remove,
}

/// Per-key outcome of a keylist update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeylistResult {
    /// The keylist changed.
    Success,
    /// Duplicate add or missing remove; nothing changed.
    NoChange,
}

/// One requested keylist change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateItem {
    /// The recipient key to add or remove.
    pub recipient_key: String,
    /// The action to apply.
    pub action: KeylistAction,
}

/// Keylist update body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdate {
    /// Requested changes, applied in order.
    pub updates: Vec<KeylistUpdateItem>,
}

/// One applied keylist change with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdated {
    /// The recipient key.
    pub recipient_key: String,
    /// The requested action.
    pub action: KeylistAction,
    /// The outcome.
    pub result: KeylistResult,
}

/// Keylist update response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    /// Outcomes, in request order.
    pub updated: Vec<KeylistUpdated>,
}

/// Forward body. The encrypted payload is opaque to the mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    /// Recipient key the payload is destined for.
    pub to: String,
    /// Base64 of the packed message.
    pub payload: String,
}

/// Batch pickup body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPickup {
    /// Maximum number of messages to return.
    pub batch_size: usize,
}

/// One message in a pickup batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedMessage {
    /// Queue id, named in the later acknowledgment.
    pub id: String,
    /// Base64 of the packed message.
    pub payload: String,
}

/// Batch body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Oldest-first queued messages, up to the requested batch size.
    pub messages: Vec<BatchedMessage>,
}

/// Acknowledgment body naming delivered queue ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesReceived {
    /// Ids from a previous batch that were safely received.
    pub message_id_list: Vec<String>,
}

/// Recipient-side mediation operations.
pub struct MediationRecipientService {
    exchange: Exchange<MediationRecord, MediationKind>,
}

impl MediationRecipientService {
    /// Build the service over the shared store, locks and event bus.
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<ThreadLocks>, events: EventBus) -> Self {
        Self {
            exchange: Exchange::new(mediation_table(), store, locks, events),
        }
    }

    /// Look up the mediation record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<MediationRecord>> {
        self.exchange.find(thread_id).await
    }

    /// Ask a mediator to route for us.
    pub async fn request_mediation(
        &self,
        connection_id: impl Into<String>,
    ) -> SkeinResult<(MediationRecord, OutboundMessage)> {
        let message = WireMessage::new(TYPE_MEDIATE_REQUEST, serde_json::Value::Null);
        let record = MediationRecord::new(
            message.thread_id().to_string(),
            connection_id.into(),
            MediationRole::Recipient,
            MediationState::Requested,
        );
        let record = self.exchange.create(record).await?;
        let connection_id = Some(record.connection_id.clone());
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// Process the mediator's grant: record its endpoint and routing keys.
    pub async fn process_grant(&self, message: &WireMessage) -> SkeinResult<Option<OutboundMessage>> {
        let body: MediateGrant = message.body_as()?;
        let record = self
            .exchange
            .apply_with(message.thread_id(), MediationKind::Grant, |record| {
                record.endpoint = Some(body.endpoint.clone());
                record.routing_keys = body.routing_keys.clone();
            })
            .await?;
        info!(thread_id = %record.thread_id, endpoint = ?record.endpoint, "mediation granted");
        Ok(None)
    }

    /// Process the mediator's denial.
    pub async fn process_deny(&self, message: &WireMessage) -> SkeinResult<Option<OutboundMessage>> {
        self.exchange
            .apply(message.thread_id(), MediationKind::Deny)
            .await?;
        Ok(None)
    }

    /// Ask the mediator to add or remove recipient keys.
    pub async fn keylist_update(
        &self,
        thread_id: &str,
        adds: &[String],
        removes: &[String],
    ) -> SkeinResult<OutboundMessage> {
        let record = self
            .exchange
            .find(thread_id)
            .await?
            .ok_or_else(|| SkeinError::RecordNotFound(thread_id.to_string()))?;
        if !record.is_ready() {
            return Err(SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: record.state.to_string(),
                trigger: "keylist-update".to_string(),
            });
        }
        let updates = adds
            .iter()
            .map(|key| KeylistUpdateItem {
                recipient_key: key.clone(),
                action: KeylistAction::Add,
            })
            .chain(removes.iter().map(|key| KeylistUpdateItem {
                recipient_key: key.clone(),
                action: KeylistAction::Remove,
            }))
            .collect();
        let message = WireMessage::new(
            TYPE_KEYLIST_UPDATE,
            serde_json::to_value(KeylistUpdate { updates })?,
        )
        .with_thread(thread_id.to_string());
        Ok(OutboundMessage::reply(message, Some(record.connection_id)))
    }

    /// Mirror successful keylist changes into our local record.
    pub async fn process_keylist_update_response(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let body: KeylistUpdateResponse = message.body_as()?;
        self.exchange
            .mutate(message.thread_id(), |record| {
                for updated in &body.updated {
                    if updated.result != KeylistResult::Success {
                        continue;
                    }
                    match updated.action {
                        KeylistAction::Add => {
                            record.add_recipient_key(updated.recipient_key.clone());
                        }
                        KeylistAction::Remove => {
                            record.remove_recipient_key(&updated.recipient_key);
                        }
                    }
                }
            })
            .await?;
        debug!(thread_id = message.thread_id(), "keylist response applied");
        Ok(None)
    }

    /// A mediator's problem report abandons nothing (grant/deny is the
    /// only state change) but still reaches the event bus.
    pub async fn process_problem_report(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let report = ProblemReport::from_wire(message)?;
        Err(SkeinError::ProblemReport {
            thread_id: report.thread_id,
            code: report.code,
            description: report.description,
        })
    }
}

/// Inbound handler for the recipient side of coordinate-mediation.
pub struct MediationRecipientHandler {
    service: Arc<MediationRecipientService>,
}

impl MediationRecipientHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<MediationRecipientService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for MediationRecipientHandler {
    fn message_types(&self) -> Vec<String> {
        vec![
            TYPE_MEDIATE_GRANT.into(),
            TYPE_MEDIATE_DENY.into(),
            TYPE_KEYLIST_UPDATE_RESPONSE.into(),
            TYPE_PROBLEM_REPORT.into(),
        ]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::LogAndDrop
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let uri = MessageTypeUri::from_str(&ctx.message.message_type)?;
        match uri.name.as_str() {
            "mediate-grant" => self.service.process_grant(&ctx.message).await,
            "mediate-deny" => self.service.process_deny(&ctx.message).await,
            "keylist-update-response" => {
                self.service.process_keylist_update_response(&ctx.message).await
            }
            "problem-report" => self.service.process_problem_report(&ctx.message).await,
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_store::MemoryStore;

    fn service() -> MediationRecipientService {
        MediationRecipientService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ThreadLocks::new()),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_request_then_grant() {
        let service = service();
        let (record, request) = service.request_mediation("conn-1").await.unwrap();
        assert_eq!(record.state, MediationState::Requested);
        assert_eq!(request.message.message_type, TYPE_MEDIATE_REQUEST);

        let grant = WireMessage::reply_to(
            TYPE_MEDIATE_GRANT,
            &request.message,
            serde_json::json!({ "endpoint": "https://mediator.example", "routing_keys": ["key-m"] }),
        );
        service.process_grant(&grant).await.unwrap();
        let record = service.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(record.state, MediationState::Granted);
        assert_eq!(record.endpoint.as_deref(), Some("https://mediator.example"));
        assert_eq!(record.routing_keys, vec!["key-m".to_string()]);

        // Duplicate grant is a declared no-op.
        service.process_grant(&grant).await.unwrap();
    }

    #[tokio::test]
    async fn test_deny_is_terminal() {
        let service = service();
        let (record, request) = service.request_mediation("conn-1").await.unwrap();

        let deny = WireMessage::reply_to(TYPE_MEDIATE_DENY, &request.message, serde_json::Value::Null);
        service.process_deny(&deny).await.unwrap();
        assert_eq!(
            service.find(&record.thread_id).await.unwrap().unwrap().state,
            MediationState::Denied
        );

        // Grant after deny has no edge.
        let grant = WireMessage::reply_to(
            TYPE_MEDIATE_GRANT,
            &request.message,
            serde_json::json!({ "endpoint": "https://late.example" }),
        );
        let err = service.process_grant(&grant).await.unwrap_err();
        assert!(err.is_state_transition());
    }

    #[tokio::test]
    async fn test_keylist_update_requires_granted() {
        let service = service();
        let (record, _) = service.request_mediation("conn-1").await.unwrap();
        let err = service
            .keylist_update(&record.thread_id, &["key-a".into()], &[])
            .await
            .unwrap_err();
        assert!(err.is_state_transition());
    }

    #[tokio::test]
    async fn test_keylist_response_mirrors_successes_only() {
        let service = service();
        let (record, request) = service.request_mediation("conn-1").await.unwrap();
        let grant = WireMessage::reply_to(
            TYPE_MEDIATE_GRANT,
            &request.message,
            serde_json::json!({ "endpoint": "https://mediator.example" }),
        );
        service.process_grant(&grant).await.unwrap();

        let response = WireMessage::new(
            TYPE_KEYLIST_UPDATE_RESPONSE,
            serde_json::json!({
                "updated": [
                    { "recipient_key": "key-a", "action": "add", "result": "success" },
                    { "recipient_key": "key-b", "action": "add", "result": "no-change" }
                ]
            }),
        )
        .with_thread(&record.thread_id);
        service.process_keylist_update_response(&response).await.unwrap();
        let record = service.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(record.recipient_keys, vec!["key-a".to_string()]);
    }
}
