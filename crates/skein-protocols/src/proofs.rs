//! Proof presentation protocol.
//!
//! Same shape as credential issuance: `propose → request → presentation
//! → ack`, with entry directly at request. Presentation construction and
//! verification delegate to the [`ProofFormatHandler`] selected by the
//! attachment's format id.

use crate::formats::FormatRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_engine::{
    EventBus, Exchange, FailurePolicy, InboundContext, MessageHandler, ThreadLocks,
    TransitionTable,
};
use skein_store::RecordStore;
use skein_types::message::MessageTypeUri;
use skein_types::records::{ProofRecord, ProofRole, ProofState};
use skein_types::{OutboundMessage, ProblemReport, SkeinError, SkeinResult, WireMessage};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Presentation proposal.
pub const TYPE_PROPOSE: &str = "https://didcomm.org/present-proof/1.0/propose-presentation";
/// Presentation request.
pub const TYPE_REQUEST: &str = "https://didcomm.org/present-proof/1.0/request-presentation";
/// The presentation itself.
pub const TYPE_PRESENTATION: &str = "https://didcomm.org/present-proof/1.0/presentation";
/// Ack completing the exchange.
pub const TYPE_ACK: &str = "https://didcomm.org/present-proof/1.0/ack";
/// Protocol-scoped problem report.
pub const TYPE_PROBLEM_REPORT: &str = "https://didcomm.org/present-proof/1.0/problem-report";

/// Problem code for a presentation that fails verification.
pub const CODE_VERIFICATION_FAILED: &str = "verification-failed";

/// Message kinds driving the proof state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofKind {
    /// Presentation proposal.
    Propose,
    /// Presentation request.
    Request,
    /// The presentation.
    Present,
    /// Completing ack.
    Ack,
    /// Problem report, abandons the exchange.
    ProblemReport,
}

impl fmt::Display for ProofKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Propose => "propose",
            Self::Request => "request",
            Self::Present => "present",
            Self::Ack => "ack",
            Self::ProblemReport => "problem-report",
        })
    }
}

/// The proof transition table for both roles.
pub fn proof_table() -> TransitionTable<ProofState, ProofKind, ProofRole> {
    use ProofKind as K;
    use ProofRole::{Prover, Verifier};
    use ProofState as S;

    let mut table = TransitionTable::new("present-proof")
        .creates(K::Propose, Verifier, S::ProposalReceived)
        .creates(K::Request, Prover, S::RequestReceived)
        // Verifier.
        .edge(S::ProposalReceived, K::Request, Verifier, S::RequestSent)
        .edge(S::RequestSent, K::Propose, Verifier, S::ProposalReceived)
        .edge(S::RequestSent, K::Present, Verifier, S::PresentationReceived)
        .edge(S::PresentationReceived, K::Ack, Verifier, S::Done)
        // Prover.
        .edge(S::ProposalSent, K::Request, Prover, S::RequestReceived)
        .edge(S::RequestReceived, K::Present, Prover, S::PresentationSent)
        .edge(S::PresentationSent, K::Ack, Prover, S::Done)
        .ignores(S::Done, K::Ack)
        .terminal(S::Done)
        .terminal(S::Abandoned);
    for role in [Verifier, Prover] {
        for state in [
            S::ProposalSent,
            S::ProposalReceived,
            S::RequestSent,
            S::RequestReceived,
            S::PresentationSent,
            S::PresentationReceived,
        ] {
            table = table.edge(state, K::ProblemReport, role, S::Abandoned);
        }
    }
    table
}

/// Shared body shape for the payload-carrying messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPayload {
    /// Free-text comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Attachment format id selecting the format handler.
    pub format: String,
    /// Format-specific attachment, opaque to the state machine.
    #[serde(default)]
    pub attachment: Value,
}

/// Builds and verifies format-specific proof payloads.
#[async_trait::async_trait]
pub trait ProofFormatHandler: Send + Sync {
    /// Build a request attachment answering a proposal.
    async fn create_request(&self, proposal: &Value) -> SkeinResult<Value>;
    /// Construct a presentation answering a request.
    async fn create_presentation(&self, request: &Value) -> SkeinResult<Value>;
    /// Verify a received presentation.
    async fn verify_presentation(&self, presentation: &Value) -> SkeinResult<bool>;
}

/// Proof protocol operations.
pub struct ProofService {
    exchange: Exchange<ProofRecord, ProofKind>,
    formats: Arc<FormatRegistry<dyn ProofFormatHandler>>,
}

impl ProofService {
    /// Build the service over the shared store, locks, bus and formats.
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
        formats: Arc<FormatRegistry<dyn ProofFormatHandler>>,
    ) -> Self {
        Self {
            exchange: Exchange::new(proof_table(), store, locks, events),
            formats,
        }
    }

    /// Look up the proof record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<ProofRecord>> {
        self.exchange.find(thread_id).await
    }

    /// Start an exchange as prover by proposing a presentation.
    pub async fn propose(
        &self,
        connection_id: impl Into<String>,
        format: impl Into<String>,
        attachment: Value,
    ) -> SkeinResult<(ProofRecord, OutboundMessage)> {
        let format = format.into();
        let message = WireMessage::new(
            TYPE_PROPOSE,
            serde_json::to_value(ProofPayload {
                comment: None,
                format: format.clone(),
                attachment,
            })?,
        );
        let mut record = ProofRecord::new(
            message.thread_id().to_string(),
            Some(connection_id.into()),
            ProofRole::Prover,
            ProofState::ProposalSent,
        );
        record.format = Some(format);
        let record = self.exchange.create(record).await?;
        let connection_id = record.connection_id.clone();
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// Start an exchange as verifier by requesting a presentation.
    pub async fn request(
        &self,
        connection_id: impl Into<String>,
        format: impl Into<String>,
        attachment: Value,
    ) -> SkeinResult<(ProofRecord, OutboundMessage)> {
        let format = format.into();
        let message = WireMessage::new(
            TYPE_REQUEST,
            serde_json::to_value(ProofPayload {
                comment: None,
                format: format.clone(),
                attachment,
            })?,
        );
        let mut record = ProofRecord::new(
            message.thread_id().to_string(),
            Some(connection_id.into()),
            ProofRole::Verifier,
            ProofState::RequestSent,
        );
        record.format = Some(format);
        let record = self.exchange.create(record).await?;
        let connection_id = record.connection_id.clone();
        Ok((record, OutboundMessage::reply(message, connection_id)))
    }

    /// Verifier side: a proposal arrived; answer with a request built by
    /// the format handler.
    pub async fn process_propose(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: ProofPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let request_attachment = handler.create_request(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = ctx.connection_id();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                ProofKind::Propose,
                || {
                    ProofRecord::new(
                        thread_id.clone(),
                        connection_id.clone(),
                        ProofRole::Verifier,
                        ProofState::ProposalReceived,
                    )
                },
                |record| record.format = Some(payload.format.clone()),
            )
            .await?;

        let request = WireMessage::reply_to(
            TYPE_REQUEST,
            &ctx.message,
            serde_json::to_value(ProofPayload {
                comment: None,
                format: payload.format,
                attachment: request_attachment,
            })?,
        );
        let record = self
            .exchange
            .apply(ctx.message.thread_id(), ProofKind::Request)
            .await?;
        Ok(Some(OutboundMessage::reply(request, record.connection_id)))
    }

    /// Prover side: a request arrived; construct and send the
    /// presentation.
    pub async fn process_request(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: ProofPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let presentation_attachment = handler.create_presentation(&payload.attachment).await?;

        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = ctx.connection_id();
        self.exchange
            .apply_or_create_with(
                &thread_id,
                ProofKind::Request,
                || {
                    ProofRecord::new(
                        thread_id.clone(),
                        connection_id.clone(),
                        ProofRole::Prover,
                        ProofState::RequestReceived,
                    )
                },
                |record| record.format = Some(payload.format.clone()),
            )
            .await?;

        let presentation = WireMessage::reply_to(
            TYPE_PRESENTATION,
            &ctx.message,
            serde_json::to_value(ProofPayload {
                comment: None,
                format: payload.format,
                attachment: presentation_attachment,
            })?,
        );
        let record = self
            .exchange
            .apply(ctx.message.thread_id(), ProofKind::Present)
            .await?;
        Ok(Some(OutboundMessage::reply(presentation, record.connection_id)))
    }

    /// Verifier side: the presentation arrived. A verified presentation
    /// is acked; a failed one abandons the exchange and tells the prover.
    pub async fn process_presentation(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let payload: ProofPayload = ctx.message.body_as()?;
        let handler = self.formats.get(&payload.format)?;
        let thread_id = ctx.message.thread_id().to_string();

        let verified = handler.verify_presentation(&payload.attachment).await?;
        if !verified {
            warn!(%thread_id, "presentation failed verification");
            self.exchange
                .apply_with(&thread_id, ProofKind::ProblemReport, |record| {
                    record.error_message = Some("presentation failed verification".into());
                })
                .await?;
            let report = ProblemReport::new(
                &thread_id,
                CODE_VERIFICATION_FAILED,
                "presentation failed verification",
            );
            return Ok(Some(OutboundMessage::reply(
                report.to_wire(TYPE_PROBLEM_REPORT),
                ctx.connection_id(),
            )));
        }

        self.exchange.apply(&thread_id, ProofKind::Present).await?;
        let ack =
            WireMessage::reply_to(TYPE_ACK, &ctx.message, serde_json::json!({ "status": "OK" }));
        let record = self.exchange.apply(&thread_id, ProofKind::Ack).await?;
        debug!(%thread_id, "presentation verified");
        Ok(Some(OutboundMessage::reply(ack, record.connection_id)))
    }

    /// Prover side: the verifier's ack. Duplicates are silent no-ops.
    pub async fn process_ack(&self, message: &WireMessage) -> SkeinResult<Option<OutboundMessage>> {
        self.exchange
            .apply_checked(message.thread_id(), ProofKind::Ack)
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
            .apply_with(message.thread_id(), ProofKind::ProblemReport, |record| {
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

/// Inbound handler for the present-proof protocol.
pub struct ProofHandler {
    service: Arc<ProofService>,
}

impl ProofHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<ProofService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ProofHandler {
    fn message_types(&self) -> Vec<String> {
        vec![
            TYPE_PROPOSE.into(),
            TYPE_REQUEST.into(),
            TYPE_PRESENTATION.into(),
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
            "propose-presentation" => self.service.process_propose(ctx).await,
            "request-presentation" => self.service.process_request(ctx).await,
            "presentation" => self.service.process_presentation(ctx).await,
            "ack" => self.service.process_ack(&ctx.message).await,
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

    /// Accepts presentations whose attachment carries `"valid": true`.
    struct StubProofFormat;

    #[async_trait::async_trait]
    impl ProofFormatHandler for StubProofFormat {
        async fn create_request(&self, proposal: &Value) -> SkeinResult<Value> {
            Ok(serde_json::json!({ "requested": proposal }))
        }

        async fn create_presentation(&self, request: &Value) -> SkeinResult<Value> {
            Ok(serde_json::json!({ "valid": true, "answers": request }))
        }

        async fn verify_presentation(&self, presentation: &Value) -> SkeinResult<bool> {
            Ok(presentation.get("valid").and_then(Value::as_bool).unwrap_or(false))
        }
    }

    const FORMAT: &str = "stub/proof@v1.0";

    fn service() -> Arc<ProofService> {
        let formats: Arc<FormatRegistry<dyn ProofFormatHandler>> = Arc::new(FormatRegistry::new());
        formats.register(FORMAT, Arc::new(StubProofFormat)).unwrap();
        Arc::new(ProofService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ThreadLocks::new()),
            EventBus::default(),
            formats,
        ))
    }

    fn ctx_for(message: WireMessage) -> InboundContext {
        InboundContext::new(message)
    }

    #[tokio::test]
    async fn test_request_to_verified_presentation() {
        let verifier = service();
        let prover = service();

        let (record, request) = verifier
            .request("conn-1", FORMAT, serde_json::json!({ "attributes": ["name"] }))
            .await
            .unwrap();
        let thread_id = record.thread_id.clone();

        let presentation = prover
            .process_request(&ctx_for(request.message))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(presentation.message.message_type, TYPE_PRESENTATION);
        assert_eq!(
            prover.find(&thread_id).await.unwrap().unwrap().state,
            ProofState::PresentationSent
        );

        let ack = verifier
            .process_presentation(&ctx_for(presentation.message))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message.message_type, TYPE_ACK);
        assert_eq!(
            verifier.find(&thread_id).await.unwrap().unwrap().state,
            ProofState::Done
        );

        prover.process_ack(&ack.message).await.unwrap();
        assert_eq!(
            prover.find(&thread_id).await.unwrap().unwrap().state,
            ProofState::Done
        );
        // Duplicate ack is a no-op.
        prover.process_ack(&ack.message).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_verification_abandons_and_reports() {
        let verifier = service();
        let (record, _) = verifier
            .request("conn-1", FORMAT, serde_json::json!({}))
            .await
            .unwrap();

        let presentation = WireMessage::new(
            TYPE_PRESENTATION,
            serde_json::json!({ "format": FORMAT, "attachment": { "valid": false } }),
        )
        .with_thread(&record.thread_id);
        let reply = verifier
            .process_presentation(&ctx_for(presentation))
            .await
            .unwrap()
            .unwrap();
        let json = serde_json::to_value(&reply.message).unwrap();
        assert_eq!(json["description"]["code"], CODE_VERIFICATION_FAILED);

        let record = verifier.find(&record.thread_id).await.unwrap().unwrap();
        assert_eq!(record.state, ProofState::Abandoned);
    }

    #[tokio::test]
    async fn test_proposal_enters_exchange() {
        let verifier = service();
        let prover = service();

        let (record, propose) = prover
            .propose("conn-1", FORMAT, serde_json::json!({ "predicate": ">= 18" }))
            .await
            .unwrap();
        assert_eq!(record.state, ProofState::ProposalSent);

        let request = verifier
            .process_propose(&ctx_for(propose.message))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.message.message_type, TYPE_REQUEST);
        assert_eq!(
            verifier.find(&record.thread_id).await.unwrap().unwrap().state,
            ProofState::RequestSent
        );
    }

    #[tokio::test]
    async fn test_presentation_for_unknown_thread_rejected() {
        let verifier = service();
        let presentation = WireMessage::new(
            TYPE_PRESENTATION,
            serde_json::json!({ "format": FORMAT, "attachment": { "valid": true } }),
        )
        .with_thread("t-ghost");
        let err = verifier
            .process_presentation(&ctx_for(presentation))
            .await
            .unwrap_err();
        assert!(err.is_state_transition());
    }
}
