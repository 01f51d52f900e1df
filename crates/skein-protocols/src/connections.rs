//! Connection establishment protocol, with the DID-rotate/hangup
//! sub-protocol that runs on an established connection.
//!
//! Responder path: `invitation-sent → request-received → response-sent →
//! completed`; the requester mirrors it. `abandoned` is reachable from
//! every other state via problem report or hangup. Acks and problem
//! reports for unknown threads are rejected outright and never create a
//! record.

use serde::{Deserialize, Serialize};
use skein_engine::{
    EventBus, Exchange, FailurePolicy, InboundContext, MessageHandler, ThreadLocks,
    TransitionTable,
};
use skein_store::RecordStore;
use skein_types::message::MessageTypeUri;
use skein_types::records::{ConnectionRecord, ConnectionRole, ConnectionState};
use skein_types::{OutboundMessage, ProblemReport, SkeinError, SkeinResult, WireMessage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection invitation.
pub const TYPE_INVITATION: &str = "https://didcomm.org/connections/1.0/invitation";
/// Connection request.
pub const TYPE_REQUEST: &str = "https://didcomm.org/connections/1.0/request";
/// Connection response.
pub const TYPE_RESPONSE: &str = "https://didcomm.org/connections/1.0/response";
/// Ack completing the exchange.
pub const TYPE_ACK: &str = "https://didcomm.org/connections/1.0/ack";
/// Protocol-scoped problem report.
pub const TYPE_PROBLEM_REPORT: &str = "https://didcomm.org/connections/1.0/problem-report";
/// DID rotation announcement.
pub const TYPE_ROTATE: &str = "https://didcomm.org/did-rotate/1.0/rotate";
/// Ack for a DID rotation.
pub const TYPE_ROTATE_ACK: &str = "https://didcomm.org/did-rotate/1.0/ack";
/// Connection hangup.
pub const TYPE_HANGUP: &str = "https://didcomm.org/did-rotate/1.0/hangup";

/// Message kinds driving the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Connection request.
    Request,
    /// Connection response.
    Response,
    /// Completing ack.
    Ack,
    /// Problem report, abandons the exchange.
    ProblemReport,
    /// Hangup, abandons the connection.
    Hangup,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Ack => "ack",
            Self::ProblemReport => "problem-report",
            Self::Hangup => "hangup",
        })
    }
}

/// The connection transition table, shared by both roles.
pub fn connection_table() -> TransitionTable<ConnectionState, ConnectionKind, ConnectionRole> {
    use ConnectionKind as K;
    use ConnectionRole::{Requester, Responder};
    use ConnectionState as S;

    let mut table = TransitionTable::new("connections")
        // A request may establish a connection without a prior
        // invitation record (public, multi-use invitations).
        .creates(K::Request, Responder, S::RequestReceived)
        .edge(S::InvitationSent, K::Request, Responder, S::RequestReceived)
        .edge(S::RequestReceived, K::Response, Responder, S::ResponseSent)
        .edge(S::ResponseSent, K::Ack, Responder, S::Completed)
        .edge(S::InvitationReceived, K::Request, Requester, S::RequestSent)
        .edge(S::RequestSent, K::Response, Requester, S::ResponseReceived)
        .edge(S::ResponseReceived, K::Ack, Requester, S::Completed)
        .ignores(S::Completed, K::Ack)
        .terminal(S::Abandoned);
    for role in [Requester, Responder] {
        for state in [
            S::InvitationSent,
            S::InvitationReceived,
            S::RequestSent,
            S::RequestReceived,
            S::ResponseSent,
            S::ResponseReceived,
            S::Completed,
        ] {
            table = table
                .edge(state, K::ProblemReport, role, S::Abandoned)
                .edge(state, K::Hangup, role, S::Abandoned);
        }
    }
    table
}

/// Connection invitation body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    /// Inviter's display label.
    pub label: String,
    /// Keys to encrypt the request to.
    pub recipient_keys: Vec<String>,
    /// Inviter's endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
    /// Mediator routing keys, outermost last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

/// Connection request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Requester's display label.
    pub label: String,
    /// Requester's DID for this relationship.
    pub did: String,
    /// Keys to encrypt replies to.
    pub recipient_keys: Vec<String>,
    /// Requester's endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Connection response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// Responder's DID for this relationship.
    pub did: String,
    /// Keys to encrypt follow-ups to.
    pub recipient_keys: Vec<String>,
    /// Responder's endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// DID rotation announcement body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rotate {
    /// The sender's new DID.
    pub to_did: String,
    /// New recipient keys, when they change with the DID.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,
}

/// Local identity this agent presents when forming connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Display label sent to peers.
    pub label: String,
    /// Our DID.
    pub did: String,
    /// Our reachable endpoint, absent for mediated-only agents.
    pub endpoint: Option<String>,
    /// Our recipient keys.
    pub recipient_keys: Vec<String>,
}

/// Connection protocol operations.
pub struct ConnectionService {
    exchange: Exchange<ConnectionRecord, ConnectionKind>,
    config: ConnectionConfig,
}

impl ConnectionService {
    /// Build the service over the shared store, locks and event bus.
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            exchange: Exchange::new(connection_table(), store, locks, events),
            config,
        }
    }

    /// Look up the connection record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<ConnectionRecord>> {
        self.exchange.find(thread_id).await
    }

    /// Create an invitation and the responder-side record tracking it.
    pub async fn create_invitation(&self) -> SkeinResult<(ConnectionRecord, WireMessage)> {
        let invitation = WireMessage::new(
            TYPE_INVITATION,
            serde_json::to_value(Invitation {
                label: self.config.label.clone(),
                recipient_keys: self.config.recipient_keys.clone(),
                service_endpoint: self.config.endpoint.clone(),
                routing_keys: Vec::new(),
            })?,
        );
        let record = ConnectionRecord::new(
            invitation.id.clone(),
            self.config.did.clone(),
            ConnectionRole::Responder,
            ConnectionState::InvitationSent,
        );
        let record = self.exchange.create(record).await?;
        info!(thread_id = %record.thread_id, "invitation created");
        Ok((record, invitation))
    }

    /// Accept a received invitation: create the requester record and the
    /// connection request to send back. The request's id starts the
    /// exchange thread; the invitation id rides along as parent thread.
    pub async fn receive_invitation(
        &self,
        invitation: &WireMessage,
    ) -> SkeinResult<(ConnectionRecord, OutboundMessage)> {
        let body: Invitation = invitation.body_as()?;
        let request = WireMessage::new(
            TYPE_REQUEST,
            serde_json::to_value(ConnectionRequest {
                label: self.config.label.clone(),
                did: self.config.did.clone(),
                recipient_keys: self.config.recipient_keys.clone(),
                endpoint: self.config.endpoint.clone(),
            })?,
        )
        .with_parent_thread(invitation.id.clone());

        let mut record = ConnectionRecord::new(
            request.thread_id().to_string(),
            self.config.did.clone(),
            ConnectionRole::Requester,
            ConnectionState::InvitationReceived,
        );
        record.their_label = Some(body.label);
        record.recipient_keys = body.recipient_keys.clone();
        record.endpoint = body.service_endpoint.clone();
        let record = self.exchange.create(record).await?;

        let thread_id = record.thread_id.clone();
        let record = self.exchange.apply(&thread_id, ConnectionKind::Request).await?;
        let outbound = OutboundMessage::reply(request, Some(record.id.clone())).with_routing(
            body.recipient_keys,
            self.config.recipient_keys.first().cloned(),
            body.service_endpoint,
        );
        Ok((record, outbound))
    }

    /// Process an inbound connection request (responder side) and produce
    /// the response.
    pub async fn process_request(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let body: ConnectionRequest = message.body_as()?;
        let thread_id = message.thread_id().to_string();
        let did = self.config.did.clone();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                ConnectionKind::Request,
                || {
                    ConnectionRecord::new(
                        thread_id.clone(),
                        did,
                        ConnectionRole::Responder,
                        ConnectionState::RequestReceived,
                    )
                },
                |record| {
                    record.their_did = Some(body.did.clone());
                    record.their_label = Some(body.label.clone());
                    record.recipient_keys = body.recipient_keys.clone();
                    record.endpoint = body.endpoint.clone();
                },
            )
            .await?;

        let response = WireMessage::reply_to(
            TYPE_RESPONSE,
            message,
            serde_json::to_value(ConnectionResponse {
                did: self.config.did.clone(),
                recipient_keys: self.config.recipient_keys.clone(),
                endpoint: self.config.endpoint.clone(),
            })?,
        );
        let record = self
            .exchange
            .apply(message.thread_id(), ConnectionKind::Response)
            .await?;
        Ok(Some(OutboundMessage::reply(response, Some(record.id)).with_routing(
            body.recipient_keys,
            self.config.recipient_keys.first().cloned(),
            body.endpoint,
        )))
    }

    /// Process an inbound connection response (requester side) and produce
    /// the completing ack.
    pub async fn process_response(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let body: ConnectionResponse = message.body_as()?;
        let thread_id = message.thread_id().to_string();
        self.exchange
            .apply_with(&thread_id, ConnectionKind::Response, |record| {
                record.their_did = Some(body.did.clone());
                record.recipient_keys = body.recipient_keys.clone();
                record.endpoint = body.endpoint.clone();
            })
            .await?;

        let ack = WireMessage::reply_to(TYPE_ACK, message, serde_json::json!({ "status": "OK" }));
        let record = self.exchange.apply(&thread_id, ConnectionKind::Ack).await?;
        debug!(%thread_id, "connection completed");
        Ok(Some(OutboundMessage::reply(ack, Some(record.id)).with_routing(
            body.recipient_keys,
            self.config.recipient_keys.first().cloned(),
            body.endpoint,
        )))
    }

    /// Process an inbound ack (responder side). Duplicate acks on a
    /// completed connection are silent no-ops.
    pub async fn process_ack(&self, message: &WireMessage) -> SkeinResult<Option<OutboundMessage>> {
        let applied = self
            .exchange
            .apply_checked(message.thread_id(), ConnectionKind::Ack)
            .await?;
        if !applied.changed {
            debug!(thread_id = message.thread_id(), "duplicate ack ignored");
        }
        Ok(None)
    }

    /// Process an inbound problem report: abandon the exchange, then
    /// surface the report so it reaches the event bus.
    pub async fn process_problem_report(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let report = ProblemReport::from_wire(message)?;
        self.exchange
            .apply(message.thread_id(), ConnectionKind::ProblemReport)
            .await?;
        Err(SkeinError::ProblemReport {
            thread_id: report.thread_id,
            code: report.code,
            description: report.description,
        })
    }

    /// Start rotating our DID on an established connection. The new DID
    /// is staged and applied to the record only once the peer acks.
    pub async fn rotate(
        &self,
        thread_id: &str,
        new_did: impl Into<String>,
    ) -> SkeinResult<OutboundMessage> {
        let new_did = new_did.into();
        self.require_completed(thread_id).await?;
        let record = self
            .exchange
            .mutate(thread_id, |record| {
                record.pending_did = Some(new_did.clone());
            })
            .await?;
        let rotate = WireMessage::new(
            TYPE_ROTATE,
            serde_json::to_value(Rotate {
                to_did: new_did,
                recipient_keys: Vec::new(),
            })?,
        )
        .with_parent_thread(record.thread_id.clone());
        Ok(OutboundMessage::reply(rotate, Some(record.id)))
    }

    /// Process a peer's rotation announcement: stage the new DID, ack,
    /// and commit the staged values together with the acknowledgment.
    pub async fn process_rotate(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: Rotate = ctx.message.body_as()?;
        let thread_id = connection.thread_id.clone();
        self.exchange
            .mutate(&thread_id, |record| {
                record.pending_their_did = Some(body.to_did.clone());
                if !body.recipient_keys.is_empty() {
                    record.pending_recipient_keys = Some(body.recipient_keys.clone());
                }
            })
            .await?;

        let ack = WireMessage::reply_to(TYPE_ROTATE_ACK, &ctx.message, serde_json::Value::Null);
        let record = self
            .exchange
            .mutate(&thread_id, |record| {
                if let Some(did) = record.pending_their_did.take() {
                    record.their_did = Some(did);
                }
                if let Some(keys) = record.pending_recipient_keys.take() {
                    record.recipient_keys = keys;
                }
            })
            .await?;
        info!(%thread_id, their_did = ?record.their_did, "peer rotated DID");
        Ok(Some(OutboundMessage::reply(ack, Some(record.id)).with_routing(
            record.recipient_keys,
            self.config.recipient_keys.first().cloned(),
            record.endpoint,
        )))
    }

    /// Process the peer's ack for a rotation we initiated: commit our
    /// staged DID. A duplicate ack finds nothing staged and is a no-op.
    pub async fn process_rotate_ack(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        self.exchange
            .mutate(&connection.thread_id, |record| {
                if let Some(did) = record.pending_did.take() {
                    record.did = did;
                }
            })
            .await?;
        Ok(None)
    }

    /// Hang up an established connection, abandoning it locally and
    /// telling the peer.
    pub async fn hangup(&self, thread_id: &str) -> SkeinResult<OutboundMessage> {
        let record = self.exchange.apply(thread_id, ConnectionKind::Hangup).await?;
        let hangup = WireMessage::new(TYPE_HANGUP, serde_json::Value::Null)
            .with_parent_thread(thread_id.to_string());
        Ok(OutboundMessage::reply(hangup, Some(record.id)).with_routing(
            record.recipient_keys,
            self.config.recipient_keys.first().cloned(),
            record.endpoint,
        ))
    }

    /// Process a peer's hangup.
    pub async fn process_hangup(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.connection.as_ref().ok_or_else(|| {
            SkeinError::Validation("hangup requires a resolved connection".into())
        })?;
        self.exchange
            .apply(&connection.thread_id, ConnectionKind::Hangup)
            .await?;
        Ok(None)
    }

    async fn require_completed(&self, thread_id: &str) -> SkeinResult<ConnectionRecord> {
        let record = self
            .exchange
            .find(thread_id)
            .await?
            .ok_or_else(|| SkeinError::RecordNotFound(thread_id.to_string()))?;
        if !record.is_ready() {
            return Err(SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: record.state.to_string(),
                trigger: "rotate".to_string(),
            });
        }
        Ok(record)
    }
}

/// Inbound handler for the connections protocol and its did-rotate
/// sub-protocol.
pub struct ConnectionHandler {
    service: Arc<ConnectionService>,
}

impl ConnectionHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<ConnectionService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ConnectionHandler {
    fn message_types(&self) -> Vec<String> {
        vec![
            TYPE_REQUEST.into(),
            TYPE_RESPONSE.into(),
            TYPE_ACK.into(),
            TYPE_PROBLEM_REPORT.into(),
            TYPE_ROTATE.into(),
            TYPE_ROTATE_ACK.into(),
            TYPE_HANGUP.into(),
        ]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Reply
    }

    fn problem_report_type(&self) -> &str {
        TYPE_PROBLEM_REPORT
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let uri = MessageTypeUri::from_str(&ctx.message.message_type)?;
        match (uri.protocol.as_str(), uri.name.as_str()) {
            ("connections", "request") => self.service.process_request(&ctx.message).await,
            ("connections", "response") => self.service.process_response(&ctx.message).await,
            ("connections", "ack") => self.service.process_ack(&ctx.message).await,
            ("connections", "problem-report") => {
                self.service.process_problem_report(&ctx.message).await
            }
            ("did-rotate", "rotate") => self.service.process_rotate(ctx).await,
            ("did-rotate", "ack") => self.service.process_rotate_ack(ctx).await,
            ("did-rotate", "hangup") => self.service.process_hangup(ctx).await,
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}
