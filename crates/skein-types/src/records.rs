//! Durable record model.
//!
//! Every protocol run persists exactly one exchange record per
//! `(protocol, thread_id)`. Records expose derived, queryable tags that
//! the store indexes; tag contents are always recomputed from the record
//! body so the two can never drift.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Derived, queryable projections of a record.
pub type RecordTags = BTreeMap<String, String>;

/// Tag key for a record's thread id.
pub const TAG_THREAD_ID: &str = "thread_id";
/// Tag key for a record's connection id.
pub const TAG_CONNECTION_ID: &str = "connection_id";
/// Tag key for a record's state.
pub const TAG_STATE: &str = "state";
/// Tag key prefix marking keylist membership (`recipient_key:<key>`).
pub const TAG_RECIPIENT_KEY_PREFIX: &str = "recipient_key:";

/// A record the store can persist and query.
pub trait BaseRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Store namespace for this record type.
    const RECORD_TYPE: &'static str;

    /// Unique record id.
    fn id(&self) -> &str;

    /// Derived tags, recomputed from the record body on every persist.
    fn tags(&self) -> RecordTags;
}

/// A record owned by a protocol state machine.
pub trait ExchangeRecord: BaseRecord {
    /// The protocol's state enumeration.
    type State: Copy + Eq + fmt::Display + fmt::Debug + Send + Sync + 'static;
    /// The protocol's role enumeration.
    type Role: Copy + Eq + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Protocol name used for lock scoping and events.
    const PROTOCOL: &'static str;

    /// Thread id correlating the exchange.
    fn thread_id(&self) -> &str;
    /// Current state.
    fn state(&self) -> Self::State;
    /// Write the new state. Only the state machine calls this.
    fn set_state(&mut self, state: Self::State);
    /// Which side of the exchange this record tracks.
    fn role(&self) -> Self::Role;
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Connection protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Invitation created and sent (responder) or received (requester).
    InvitationSent,
    /// Invitation received (requester side).
    InvitationReceived,
    /// Connection request sent.
    RequestSent,
    /// Connection request received.
    RequestReceived,
    /// Connection response sent.
    ResponseSent,
    /// Connection response received.
    ResponseReceived,
    /// Exchange complete; the connection is usable.
    Completed,
    /// Terminated by problem report or hangup.
    Abandoned,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvitationSent => "invitation-sent",
            Self::InvitationReceived => "invitation-received",
            Self::RequestSent => "request-sent",
            Self::RequestReceived => "request-received",
            Self::ResponseSent => "response-sent",
            Self::ResponseReceived => "response-received",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Which side of a connection exchange a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionRole {
    /// Received the invitation, sends the request.
    Requester,
    /// Created the invitation, sends the response.
    Responder,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requester => "requester",
            Self::Responder => "responder",
        })
    }
}

/// Durable state of one connection with a peer.
///
/// Created on invitation or request, mutated through the exchange states,
/// never deleted automatically. DID rotation stages the new DID in
/// `pending_their_did`/`pending_recipient_keys` and applies it only once
/// the peer acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Our DID for this relationship.
    pub did: String,
    /// The peer's DID, known once their request/response arrives.
    pub their_did: Option<String>,
    /// The peer's display label.
    pub their_label: Option<String>,
    /// Exchange role.
    pub role: ConnectionRole,
    /// Exchange state.
    pub state: ConnectionState,
    /// The peer's current keys, the ones we encrypt to when sending.
    pub recipient_keys: Vec<String>,
    /// The peer's endpoint, if known.
    pub endpoint: Option<String>,
    /// Mediator handling our inbound traffic, if any.
    pub mediator_id: Option<String>,
    /// Our staged DID while a rotation we initiated awaits the peer's ack.
    pub pending_did: Option<String>,
    /// Staged DID for an in-flight rotation.
    pub pending_their_did: Option<String>,
    /// Staged recipient keys for an in-flight rotation.
    pub pending_recipient_keys: Option<Vec<String>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Create a record in the given initial state.
    pub fn new(
        thread_id: impl Into<String>,
        did: impl Into<String>,
        role: ConnectionRole,
        state: ConnectionState,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            did: did.into(),
            their_did: None,
            their_label: None,
            role,
            state,
            recipient_keys: Vec::new(),
            endpoint: None,
            mediator_id: None,
            pending_did: None,
            pending_their_did: None,
            pending_recipient_keys: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the connection has completed its exchange.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Completed
    }
}

impl BaseRecord for ConnectionRecord {
    const RECORD_TYPE: &'static str = "connection";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        tags.insert("did".into(), self.did.clone());
        if let Some(their_did) = &self.their_did {
            tags.insert("their_did".into(), their_did.clone());
        }
        for key in &self.recipient_keys {
            tags.insert(format!("{TAG_RECIPIENT_KEY_PREFIX}{key}"), "1".into());
        }
        tags
    }
}

impl ExchangeRecord for ConnectionRecord {
    type State = ConnectionState;
    type Role = ConnectionRole;

    const PROTOCOL: &'static str = "connections";

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    fn role(&self) -> ConnectionRole {
        self.role
    }
}

// ---------------------------------------------------------------------------
// Mediation
// ---------------------------------------------------------------------------

/// Mediation relationship states. Grant/deny is one-shot and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediationState {
    /// Mediation requested, awaiting grant or deny.
    Requested,
    /// Mediator agreed to route for the recipient.
    Granted,
    /// Mediator refused.
    Denied,
}

impl fmt::Display for MediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::Granted => "granted",
            Self::Denied => "denied",
        })
    }
}

/// Which side of a mediation relationship a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediationRole {
    /// The routing agent holding the queue.
    Mediator,
    /// The agent whose traffic is routed.
    Recipient,
}

impl fmt::Display for MediationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mediator => "mediator",
            Self::Recipient => "recipient",
        })
    }
}

/// How queued messages reach the recipient.
///
/// This is a policy flag consulted after a message is queued, not a
/// separate delivery code path; queueing itself is unconditional so the
/// at-least-once property does not depend on the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStrategy {
    /// Server-initiated push notification after enqueue.
    Push,
    /// POST a notification to a registered webhook.
    Webhook,
    /// Pull-only: the recipient polls via pickup.
    #[default]
    None,
}

impl fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Webhook => "webhook",
            Self::None => "none",
        })
    }
}

/// Durable state of one mediation relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediationRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Connection the relationship runs over.
    pub connection_id: String,
    /// Role of this agent in the relationship.
    pub role: MediationRole,
    /// Relationship state.
    pub state: MediationState,
    /// Keylist: recipient keys the mediator routes for. Entries unique.
    pub recipient_keys: Vec<String>,
    /// Mediator routing keys returned in the grant.
    pub routing_keys: Vec<String>,
    /// Mediator endpoint returned in the grant.
    pub endpoint: Option<String>,
    /// Delivery policy for queued messages.
    pub delivery_strategy: DeliveryStrategy,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl MediationRecord {
    /// Create a record in the given initial state.
    pub fn new(
        thread_id: impl Into<String>,
        connection_id: impl Into<String>,
        role: MediationRole,
        state: MediationState,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            connection_id: connection_id.into(),
            role,
            state,
            recipient_keys: Vec::new(),
            routing_keys: Vec::new(),
            endpoint: None,
            delivery_strategy: DeliveryStrategy::default(),
            created_at: Utc::now(),
        }
    }

    /// Add a recipient key. Duplicate adds are no-ops; returns whether the
    /// keylist changed.
    pub fn add_recipient_key(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.recipient_keys.contains(&key) {
            false
        } else {
            self.recipient_keys.push(key);
            true
        }
    }

    /// Remove a recipient key. Removing an absent key is a no-op; returns
    /// whether the keylist changed.
    pub fn remove_recipient_key(&mut self, key: &str) -> bool {
        let before = self.recipient_keys.len();
        self.recipient_keys.retain(|k| k != key);
        self.recipient_keys.len() != before
    }

    /// Whether the relationship is granted and usable for routing.
    pub fn is_ready(&self) -> bool {
        self.state == MediationState::Granted
    }
}

impl BaseRecord for MediationRecord {
    const RECORD_TYPE: &'static str = "mediation";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_CONNECTION_ID.into(), self.connection_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        tags.insert("role".into(), self.role.to_string());
        for key in &self.recipient_keys {
            tags.insert(format!("{TAG_RECIPIENT_KEY_PREFIX}{key}"), "1".into());
        }
        tags
    }
}

impl ExchangeRecord for MediationRecord {
    type State = MediationState;
    type Role = MediationRole;

    const PROTOCOL: &'static str = "coordinate-mediation";

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn state(&self) -> MediationState {
        self.state
    }

    fn set_state(&mut self, state: MediationState) {
        self.state = state;
    }

    fn role(&self) -> MediationRole {
        self.role
    }
}

// ---------------------------------------------------------------------------
// Credential issuance
// ---------------------------------------------------------------------------

/// Credential exchange states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    /// Proposal sent (holder).
    ProposalSent,
    /// Proposal received (issuer).
    ProposalReceived,
    /// Offer sent (issuer).
    OfferSent,
    /// Offer received (holder).
    OfferReceived,
    /// Request sent (holder).
    RequestSent,
    /// Request received (issuer).
    RequestReceived,
    /// Credential issued, awaiting ack (issuer).
    CredentialIssued,
    /// Credential received, ack pending (holder).
    CredentialReceived,
    /// Exchange complete.
    Done,
    /// Terminated by problem report.
    Abandoned,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProposalSent => "proposal-sent",
            Self::ProposalReceived => "proposal-received",
            Self::OfferSent => "offer-sent",
            Self::OfferReceived => "offer-received",
            Self::RequestSent => "request-sent",
            Self::RequestReceived => "request-received",
            Self::CredentialIssued => "credential-issued",
            Self::CredentialReceived => "credential-received",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Which side of a credential exchange a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialRole {
    /// Issues the credential.
    Issuer,
    /// Receives and holds the credential.
    Holder,
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Issuer => "issuer",
            Self::Holder => "holder",
        })
    }
}

/// Durable state of one credential issuance exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Connection the exchange runs over.
    pub connection_id: Option<String>,
    /// Exchange role.
    pub role: CredentialRole,
    /// Exchange state.
    pub state: CredentialState,
    /// Attachment format identifier selecting the format handler.
    pub format: Option<String>,
    /// Problem-report reason when abandoned.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Create a record in the given initial state.
    pub fn new(
        thread_id: impl Into<String>,
        connection_id: Option<String>,
        role: CredentialRole,
        state: CredentialState,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            connection_id,
            role,
            state,
            format: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

impl BaseRecord for CredentialRecord {
    const RECORD_TYPE: &'static str = "credential";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        if let Some(connection_id) = &self.connection_id {
            tags.insert(TAG_CONNECTION_ID.into(), connection_id.clone());
        }
        tags
    }
}

impl ExchangeRecord for CredentialRecord {
    type State = CredentialState;
    type Role = CredentialRole;

    const PROTOCOL: &'static str = "issue-credential";

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn state(&self) -> CredentialState {
        self.state
    }

    fn set_state(&mut self, state: CredentialState) {
        self.state = state;
    }

    fn role(&self) -> CredentialRole {
        self.role
    }
}

// ---------------------------------------------------------------------------
// Proof presentation
// ---------------------------------------------------------------------------

/// Proof presentation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofState {
    /// Proposal sent (prover).
    ProposalSent,
    /// Proposal received (verifier).
    ProposalReceived,
    /// Request sent (verifier).
    RequestSent,
    /// Request received (prover).
    RequestReceived,
    /// Presentation sent, awaiting ack (prover).
    PresentationSent,
    /// Presentation received, ack pending (verifier).
    PresentationReceived,
    /// Exchange complete.
    Done,
    /// Terminated by problem report.
    Abandoned,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProposalSent => "proposal-sent",
            Self::ProposalReceived => "proposal-received",
            Self::RequestSent => "request-sent",
            Self::RequestReceived => "request-received",
            Self::PresentationSent => "presentation-sent",
            Self::PresentationReceived => "presentation-received",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Which side of a proof exchange a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProofRole {
    /// Requests and verifies the presentation.
    Verifier,
    /// Constructs and presents the proof.
    Prover,
}

impl fmt::Display for ProofRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verifier => "verifier",
            Self::Prover => "prover",
        })
    }
}

/// Durable state of one proof presentation exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Connection the exchange runs over.
    pub connection_id: Option<String>,
    /// Exchange role.
    pub role: ProofRole,
    /// Exchange state.
    pub state: ProofState,
    /// Attachment format identifier selecting the format handler.
    pub format: Option<String>,
    /// Problem-report reason when abandoned.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ProofRecord {
    /// Create a record in the given initial state.
    pub fn new(
        thread_id: impl Into<String>,
        connection_id: Option<String>,
        role: ProofRole,
        state: ProofState,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            connection_id,
            role,
            state,
            format: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

impl BaseRecord for ProofRecord {
    const RECORD_TYPE: &'static str = "proof";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        if let Some(connection_id) = &self.connection_id {
            tags.insert(TAG_CONNECTION_ID.into(), connection_id.clone());
        }
        tags
    }
}

impl ExchangeRecord for ProofRecord {
    type State = ProofState;
    type Role = ProofRole;

    const PROTOCOL: &'static str = "present-proof";

    fn thread_id(&self) -> &str {
        &self.thread_id
    }

    fn state(&self) -> ProofState {
        self.state
    }

    fn set_state(&mut self, state: ProofState) {
        self.state = state;
    }

    fn role(&self) -> ProofRole {
        self.role
    }
}

// ---------------------------------------------------------------------------
// Mediator queue
// ---------------------------------------------------------------------------

/// One encrypted message buffered for a recipient that is not directly
/// reachable. Append-only per recipient key; removed only when the
/// recipient acknowledges delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Message id used in pickup acknowledgments.
    pub id: String,
    /// Recipient key the message is queued under.
    pub recipient_key: String,
    /// Packed payload, opaque to the mediator.
    pub encrypted_payload: Vec<u8>,
    /// Arrival timestamp; ordering within a key is arrival order.
    pub received_at: DateTime<Utc>,
    /// Arrival sequence number, tie-breaker for identical timestamps.
    pub seq: u64,
}

impl BaseRecord for QueuedMessage {
    const RECORD_TYPE: &'static str = "queued-message";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert("recipient_key".into(), self.recipient_key.clone());
        tags
    }
}

// ---------------------------------------------------------------------------
// Basic message
// ---------------------------------------------------------------------------

/// Stored chat history entry for the basic message protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicMessageRecord {
    /// Record id.
    pub id: String,
    /// Connection the message arrived on.
    pub connection_id: String,
    /// Message content.
    pub content: String,
    /// Sender-declared send time.
    pub sent_time: Option<DateTime<Utc>>,
    /// Local receipt time.
    pub created_at: DateTime<Utc>,
}

impl BaseRecord for BasicMessageRecord {
    const RECORD_TYPE: &'static str = "basic-message";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_CONNECTION_ID.into(), self.connection_id.clone());
        tags
    }
}

// ---------------------------------------------------------------------------
// Question/answer
// ---------------------------------------------------------------------------

/// Question/answer exchange states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionAnswerState {
    /// Question sent, awaiting answer.
    QuestionSent,
    /// Question received, answer pending.
    QuestionReceived,
    /// Answer received by the questioner.
    AnswerReceived,
    /// Answer sent by the responder.
    AnswerSent,
}

impl fmt::Display for QuestionAnswerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::QuestionSent => "question-sent",
            Self::QuestionReceived => "question-received",
            Self::AnswerReceived => "answer-received",
            Self::AnswerSent => "answer-sent",
        })
    }
}

/// Durable state of one question/answer exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnswerRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Connection the exchange runs over.
    pub connection_id: String,
    /// Exchange state.
    pub state: QuestionAnswerState,
    /// Question text.
    pub question_text: String,
    /// Responses the questioner will accept.
    pub valid_responses: Vec<String>,
    /// The chosen response, once answered.
    pub response: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl BaseRecord for QuestionAnswerRecord {
    const RECORD_TYPE: &'static str = "question-answer";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_CONNECTION_ID.into(), self.connection_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        tags
    }
}

// ---------------------------------------------------------------------------
// Action menu
// ---------------------------------------------------------------------------

/// Action menu session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionMenuState {
    /// Menu requested from the peer.
    AwaitingMenu,
    /// Menu received/presented; a selection may be performed.
    PreparingSelection,
    /// Selection performed; session closed.
    Done,
}

impl fmt::Display for ActionMenuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitingMenu => "awaiting-menu",
            Self::PreparingSelection => "preparing-selection",
            Self::Done => "done",
        })
    }
}

/// The per-connection active action menu session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMenuRecord {
    /// Record id.
    pub id: String,
    /// Exchange thread id.
    pub thread_id: String,
    /// Connection the session runs over.
    pub connection_id: String,
    /// Session state.
    pub state: ActionMenuState,
    /// Menu title, once received.
    pub title: Option<String>,
    /// Option names offered by the menu.
    pub options: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl BaseRecord for ActionMenuRecord {
    const RECORD_TYPE: &'static str = "action-menu";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> RecordTags {
        let mut tags = RecordTags::new();
        tags.insert(TAG_THREAD_ID.into(), self.thread_id.clone());
        tags.insert(TAG_CONNECTION_ID.into(), self.connection_id.clone());
        tags.insert(TAG_STATE.into(), self.state.to_string());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keylist_add_is_idempotent() {
        let mut record = MediationRecord::new(
            "t-1",
            "conn-1",
            MediationRole::Mediator,
            MediationState::Granted,
        );
        assert!(record.add_recipient_key("key-a"));
        assert!(!record.add_recipient_key("key-a"));
        assert_eq!(record.recipient_keys, vec!["key-a".to_string()]);
    }

    #[test]
    fn test_keylist_remove_absent_is_noop() {
        let mut record = MediationRecord::new(
            "t-1",
            "conn-1",
            MediationRole::Mediator,
            MediationState::Granted,
        );
        record.add_recipient_key("key-a");
        assert!(!record.remove_recipient_key("key-b"));
        assert!(record.remove_recipient_key("key-a"));
        assert!(record.recipient_keys.is_empty());
    }

    #[test]
    fn test_tags_track_record_body() {
        let mut record = MediationRecord::new(
            "t-7",
            "conn-7",
            MediationRole::Mediator,
            MediationState::Requested,
        );
        record.add_recipient_key("key-x");
        let tags = record.tags();
        assert_eq!(tags.get(TAG_THREAD_ID).unwrap(), "t-7");
        assert_eq!(tags.get(TAG_STATE).unwrap(), "requested");
        assert!(tags.contains_key("recipient_key:key-x"));

        record.set_state(MediationState::Granted);
        assert_eq!(record.tags().get(TAG_STATE).unwrap(), "granted");
    }

    #[test]
    fn test_state_display_kebab_case() {
        assert_eq!(ConnectionState::RequestReceived.to_string(), "request-received");
        assert_eq!(CredentialState::CredentialIssued.to_string(), "credential-issued");
        assert_eq!(ProofState::PresentationSent.to_string(), "presentation-sent");
        assert_eq!(DeliveryStrategy::None.to_string(), "none");
    }

    #[test]
    fn test_connection_record_serde_roundtrip() {
        let record = ConnectionRecord::new(
            "t-1",
            "did:peer:alice",
            ConnectionRole::Responder,
            ConnectionState::InvitationSent,
        );
        let json = serde_json::to_string(&record).unwrap();
        let back: ConnectionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.state, ConnectionState::InvitationSent);
        assert_eq!(back.role, ConnectionRole::Responder);
    }
}
