//! Credential issuance protocol.
//!
//! `propose → offer → request → issue → ack`, where a party may enter at
//! offer or request directly. The state machine tracks protocol-level
//! state only; payload construction and validation is delegated to the
//! [`CredentialFormatHandler`] selected by the attachment's format id.

use crate::formats::FormatRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_engine::{
    EventBus, Exchange, FailurePolicy, InboundContext, MessageHandler, ThreadLocks,
    TransitionTable,
};
use skein_store::RecordStore;
use skein_types::message::MessageTypeUri;
use skein_types::records::{CredentialRecord, CredentialRole, CredentialState};
use skein_types::{OutboundMessage, ProblemReport, SkeinError, SkeinResult, WireMessage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Credential proposal.
pub const TYPE_PROPOSE: &str = "https://didcomm.org/issue-credential/1.0/propose-credential";
/// Credential offer.
pub const TYPE_OFFER: &str = "https://didcomm.org/issue-credential/1.0/offer-credential";
/// Credential request.
pub const TYPE_REQUEST: &str = "https://didcomm.org/issue-credential/1.0/request-credential";
/// Issued credential.
pub const TYPE_ISSUE: &str = "https://didcomm.org/issue-credential/1.0/issue-credential";
/// Ack completing the exchange.
pub const TYPE_ACK: &str = "https://didcomm.org/issue-credential/1.0/ack";
/// Protocol-scoped problem report.
pub const TYPE_PROBLEM_REPORT: &str = "https://didcomm.org/issue-credential/1.0/problem-report";

/// Message kinds driving the credential state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Proposal (either direction of negotiation).
    Propose,
    /// Offer.
    Offer,
    /// Request.
    Request,
    /// Credential issuance.
    Issue,
    /// Completing ack.
    Ack,
    /// Problem report, abandons the exchange.
    ProblemReport,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Propose => "propose",
            Self::Offer => "offer",
            Self::Request => "request",
            Self::Issue => "issue",
            Self::Ack => "ack",
            Self::ProblemReport => "problem-report",
        })
    }
}

/// The credential transition table for both roles.
pub fn credential_table() -> TransitionTable<CredentialState, CredentialKind, CredentialRole> {
    use CredentialKind as K;
    use CredentialRole::{Holder, Issuer};
    use CredentialState as S;

    let mut table = TransitionTable::new("issue-credential")
        .creates(K::Propose, Issuer, S::ProposalReceived)
        .creates(K::Offer, Holder, S::OfferReceived)
        .creates(K::Request, Issuer, S::RequestReceived)
        // Issuer.
        .edge(S::ProposalReceived, K::Offer, Issuer, S::OfferSent)
        .edge(S::OfferSent, K::Propose, Issuer, S::ProposalReceived)
        .edge(S::OfferSent, K::Request, Issuer, S::RequestReceived)
        .edge(S::RequestReceived, K::Issue, Issuer, S::CredentialIssued)
        .edge(S::CredentialIssued, K::Ack, Issuer, S::Done)
        // Holder.
        .edge(S::ProposalSent, K::Offer, Holder, S::OfferReceived)
        .edge(S::OfferReceived, K::Propose, Holder, S::ProposalSent)
        .edge(S::OfferReceived, K::Request, Holder, S::RequestSent)
        .edge(S::RequestSent, K::Issue, Holder, S::CredentialReceived)
        .edge(S::CredentialReceived, K::Ack, Holder, S::Done)
        .ignores(S::Done, K::Ack)
        .terminal(S::Done)
        .terminal(S::Abandoned);
    for role in [Issuer, Holder] {
        for state in [
            S::ProposalSent,
            S::ProposalReceived,
            S::OfferSent,
            S::OfferReceived,
            S::RequestSent,
            S::RequestReceived,
            S::CredentialIssued,
            S::CredentialReceived,
        ] {
            table = table.edge(state, K::ProblemReport, role, S::Abandoned);
        }
    }
    table
}

/// Shared body shape for the four payload-carrying messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPayload {
    /// Free-text comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Attachment format id selecting the format handler.
    pub format: String,
    /// Format-specific attachment, opaque to the state machine.
    #[serde(default)]
    pub attachment: Value,
}

/// Builds and validates format-specific credential payloads.
#[async_trait::async_trait]
pub trait CredentialFormatHandler: Send + Sync {
    /// Build an offer attachment answering a proposal.
    async fn create_offer(&self, proposal: &Value) -> SkeinResult<Value>;
    /// Build a request attachment answering an offer.
    async fn create_request(&self, offer: &Value) -> SkeinResult<Value>;
    /// Build the credential attachment answering a request.
    async fn create_credential(&self, request: &Value) -> SkeinResult<Value>;
    /// Validate and store a received credential.
    async fn process_credential(&self, credential: &Value) -> SkeinResult<()>;
}

/// Credential protocol operations.
pub struct CredentialService {
    exchange: Exchange<CredentialRecord, CredentialKind>,
    formats: Arc<FormatRegistry<dyn CredentialFormatHandler>>,
}

impl CredentialService {
    /// Build the service over the shared store, locks, bus and formats.
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
        formats: Arc<FormatRegistry<dyn CredentialFormatHandler>>,
    ) -> Self {
        Self {
            exchange: Exchange::new(credential_table(), store, locks, events),
            formats,
        }
    }

    /// Look up the credential record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<CredentialRecord>> {
        self.exchange.find(thread_id).await
    }

    /// Start an exchange as holder by proposing a credential.
    pub async fn propose(
        &self,
        connection_id: impl Into<String>,
        format: impl Into<String>,
        attachment: Value,
    ) -> SkeinResult<(CredentialRecord, OutboundMessage)> {
        let format = format.into();
        let message = WireMessage::new(
            TYPE_PROPOSE,
            serde_json::to_value(CredentialPayload {
                comment: None,
                format: format.clone(),
                attachment,
            })?,
        );
        let mut record = CredentialRecord::new(
            message.thread_id().to_string(),
            Some(connection_id.into()),
            CredentialRole::Holder,
            CredentialState::ProposalSent,
        );
        record.format = Some(format);
        let record = self.exchange.create(record).await?;
        let connection_id = record.connection_id.clone();
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// Start an exchange as issuer by offering a credential.
    pub async fn offer(
        &self,
        connection_id: impl Into<String>,
        format: impl Into<String>,
        attachment: Value,
    ) -> SkeinResult<(CredentialRecord, OutboundMessage)> {
        let format = format.into();
        let message = WireMessage::new(
            TYPE_OFFER,
            serde_json::to_value(CredentialPayload {
                comment: None,
                format: format.clone(),
                attachment,
            })?,
        );
        let mut record = CredentialRecord::new(
            message.thread_id().to_string(),
            Some(connection_id.into()),
            CredentialRole::Issuer,
            CredentialState::OfferSent,
        );
        record.format = Some(format);
        let record = self.exchange.create(record).await?;
        let connection_id = record.connection_id.clone();
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// Issuer side: a proposal arrived; answer with an offer built by the
    /// format handler.
    pub async fn process_propose(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: CredentialPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let offer_attachment = handler.create_offer(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = ctx.connection_id();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                CredentialKind::Propose,
                || {
                    CredentialRecord::new(
                        thread_id.clone(),
                        connection_id.clone(),
                        CredentialRole::Issuer,
                        CredentialState::ProposalReceived,
                    )
                },
                |record| record.format = Some(payload.format.clone()),
            )
            .await?;

        let offer = WireMessage::reply_to(
            TYPE_OFFER,
            &ctx.message,
            serde_json::to_value(CredentialPayload {
                comment: None,
                format: payload.format,
                attachment: offer_attachment,
            })?,
        );
        let record = self
            .exchange
            .apply(ctx.message.thread_id(), CredentialKind::Offer)
            .await?;
        Ok(Some(OutboundMessage::reply(offer, record.connection_id)))
    }

    /// Holder side: an offer arrived; answer with a request.
    pub async fn process_offer(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: CredentialPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let request_attachment = handler.create_request(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = ctx.connection_id();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                CredentialKind::Offer,
                || {
                    CredentialRecord::new(
                        thread_id.clone(),
                        connection_id.clone(),
                        CredentialRole::Holder,
                        CredentialState::OfferReceived,
                    )
                },
                |record| record.format = Some(payload.format.clone()),
            )
            .await?;

        let request = WireMessage::reply_to(
            TYPE_REQUEST,
            &ctx.message,
            serde_json::to_value(CredentialPayload {
                comment: None,
                format: payload.format,
                attachment: request_attachment,
            })?,
        );
        let record = self
            .exchange
            .apply(ctx.message.thread_id(), CredentialKind::Request)
            .await?;
        Ok(Some(OutboundMessage::reply(request, record.connection_id)))
    }

    /// Issuer side: a request arrived; answer with the credential.
    pub async fn process_request(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: CredentialPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let credential_attachment = handler.create_credential(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = ctx.connection_id();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                CredentialKind::Request,
                || {
                    CredentialRecord::new(
                        thread_id.clone(),
                        connection_id.clone(),
                        CredentialRole::Issuer,
                        CredentialState::RequestReceived,
                    )
                },
                |record| record.format = Some(payload.format.clone()),
            )
            .await?;

        let issue = WireMessage::reply_to(
            TYPE_ISSUE,
            &ctx.message,
            serde_json::to_value(CredentialPayload {
                comment: None,
                format: payload.format,
                attachment: credential_attachment,
            })?,
        );
        let record = self
            .exchange
            .apply(ctx.message.thread_id(), CredentialKind::Issue)
            .await?;
        Ok(Some(OutboundMessage::reply(issue, record.connection_id)))
    }

    /// Holder side: the credential arrived; store it and ack.
    pub async fn process_issue(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: CredentialPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        handler.process_credential(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        self.exchange.apply(&thread_id, CredentialKind::Issue).await?;

        let ack =
            WireMessage::reply_to(TYPE_ACK, &ctx.message, serde_json::json!({ "status": "OK" }));
        let record = self.exchange.apply(&thread_id, CredentialKind::Ack).await?;
        debug!(%thread_id, "credential exchange done");
        Ok(Some(OutboundMessage::reply(ack, record.connection_id)))
    }

    /// Issuer side: the holder's ack. Duplicates on a done exchange are
    /// silent no-ops.
    pub async fn process_ack(&self, message: &WireMessage) -> SkeinResult<Option<OutboundMessage>> {
        self.exchange
            .apply_checked(message.thread_id(), CredentialKind::Ack)
            .await?;
        Ok(None)
    }

    /// A peer's problem report abandons the exchange.
    pub async fn process_problem_report(
        &self,
        message: &WireMessage,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let report = ProblemReport::from_wire(message)?;
        let description = report.description.clone();
        self.exchange
            .apply_with(message.thread_id(), CredentialKind::ProblemReport, |record| {
                record.error_message = Some(description);
            })
            .await?;
        Err(SkeinError::ProblemReport {
            thread_id: report.thread_id,
            code: report.code,
            description: report.description,
        })
    }
}

/// Inbound handler for the issue-credential protocol.
pub struct CredentialHandler {
    service: Arc<CredentialService>,
}

impl CredentialHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<CredentialService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for CredentialHandler {
    fn message_types(&self) -> Vec<String> {
        vec![
            TYPE_PROPOSE.into(),
            TYPE_OFFER.into(),
            TYPE_REQUEST.into(),
            TYPE_ISSUE.into(),
            TYPE_ACK.into(),
            TYPE_PROBLEM_REPORT.into(),
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
        match uri.name.as_str() {
            "propose-credential" => self.service.process_propose(ctx).await,
            "offer-credential" => self.service.process_offer(ctx).await,
            "request-credential" => self.service.process_request(ctx).await,
            "issue-credential" => self.service.process_issue(ctx).await,
            "ack" => self.service.process_ack(&ctx.message).await,
            "problem-report" => self.service.process_problem_report(&ctx.message).await,
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}
