//! Agent assembly: store, event bus, dispatcher, outbound worker and
//! every protocol handler wired together from one config.

use crate::config::{AgentConfig, StorageBackend};
use skein_engine::{
    Dispatcher, EnvelopeBoundary, EventBus, EventReceiver, HandlerRegistry, InboundContext,
    OutboundQueue, OutboundWorker, ThreadLocks, TransportSender,
};
use skein_mediator::{MediatorConfig, MediatorHandler, MediatorService, RoutingQueue};
use skein_protocols::actionmenu::{ActionMenuHandler, ActionMenuService, Menu};
use skein_protocols::basicmessage::{BasicMessageHandler, BasicMessageService};
use skein_protocols::discovery::DiscoverFeaturesHandler;
use skein_protocols::questionanswer::{QuestionAnswerHandler, QuestionAnswerService};
use skein_protocols::trustping::TrustPingHandler;
use skein_protocols::{
    ConnectionConfig, ConnectionHandler, ConnectionService, CredentialFormatHandler,
    CredentialHandler, CredentialService, FormatRegistry, MediationRecipientHandler,
    MediationRecipientService, ProofFormatHandler, ProofHandler, ProofService,
};
use skein_store::{MemoryStore, RecordStore, RecordStoreExt, SqliteStore};
use skein_types::records::{ConnectionRecord, RecordTags, TAG_RECIPIENT_KEY_PREFIX};
use skein_types::{OutboundMessage, SkeinError, SkeinResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A running agent: shared infrastructure plus one service per protocol.
pub struct Agent {
    config: AgentConfig,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    registry: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    outbound: OutboundQueue,
    envelope: Arc<dyn EnvelopeBoundary>,
    connections: Arc<ConnectionService>,
    credentials: Arc<CredentialService>,
    credential_formats: Arc<FormatRegistry<dyn CredentialFormatHandler>>,
    proofs: Arc<ProofService>,
    proof_formats: Arc<FormatRegistry<dyn ProofFormatHandler>>,
    mediation: Arc<MediationRecipientService>,
    basic_messages: Arc<BasicMessageService>,
    question_answer: Arc<QuestionAnswerService>,
    action_menu: Arc<ActionMenuService>,
    mediator: Option<Arc<MediatorService>>,
}

impl Agent {
    /// Build the agent and spawn its outbound worker. Must run inside a
    /// tokio runtime.
    pub async fn start(
        config: AgentConfig,
        envelope: Arc<dyn EnvelopeBoundary>,
        transport: Arc<dyn TransportSender>,
    ) -> SkeinResult<Self> {
        Self::start_with_menu(config, envelope, transport, None).await
    }

    /// Like [`Agent::start`], additionally serving `menu` to action-menu
    /// requesters.
    pub async fn start_with_menu(
        config: AgentConfig,
        envelope: Arc<dyn EnvelopeBoundary>,
        transport: Arc<dyn TransportSender>,
        menu: Option<Menu>,
    ) -> SkeinResult<Self> {
        let store: Arc<dyn RecordStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Sqlite => {
                let path = config.storage.path.clone().ok_or_else(|| {
                    SkeinError::Storage("sqlite backend requires storage.path".into())
                })?;
                Arc::new(SqliteStore::open(path)?)
            }
        };
        let events = EventBus::default();
        let locks = Arc::new(ThreadLocks::new());
        let registry = Arc::new(HandlerRegistry::new());

        let connections = Arc::new(ConnectionService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
            ConnectionConfig {
                label: config.identity.label.clone(),
                did: config.identity.did.clone(),
                endpoint: config.identity.endpoint.clone(),
                recipient_keys: config.identity.recipient_keys.clone(),
            },
        ));
        let credential_formats: Arc<FormatRegistry<dyn CredentialFormatHandler>> =
            Arc::new(FormatRegistry::new());
        let credentials = Arc::new(CredentialService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
            Arc::clone(&credential_formats),
        ));
        let proof_formats: Arc<FormatRegistry<dyn ProofFormatHandler>> =
            Arc::new(FormatRegistry::new());
        let proofs = Arc::new(ProofService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
            Arc::clone(&proof_formats),
        ));
        let mediation = Arc::new(MediationRecipientService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
        ));
        let basic_messages = Arc::new(BasicMessageService::new(Arc::clone(&store)));
        let question_answer = Arc::new(QuestionAnswerService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
        ));
        let action_menu = Arc::new(ActionMenuService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            events.clone(),
            menu,
        ));

        registry.register_handler(Arc::new(ConnectionHandler::new(Arc::clone(&connections))))?;
        registry.register_handler(Arc::new(CredentialHandler::new(Arc::clone(&credentials))))?;
        registry.register_handler(Arc::new(ProofHandler::new(Arc::clone(&proofs))))?;
        registry.register_handler(Arc::new(MediationRecipientHandler::new(Arc::clone(
            &mediation,
        ))))?;
        registry.register_handler(Arc::new(TrustPingHandler))?;
        registry.register_handler(Arc::new(BasicMessageHandler::new(Arc::clone(&store))))?;
        registry.register_handler(Arc::new(QuestionAnswerHandler::new(Arc::clone(
            &question_answer,
        ))))?;
        registry.register_handler(Arc::new(ActionMenuHandler::new(Arc::clone(&action_menu))))?;
        registry.register_handler(Arc::new(DiscoverFeaturesHandler::new(Arc::clone(
            &registry,
        ))))?;

        let mediator = if config.mediator.enabled {
            let service = Arc::new(MediatorService::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                events.clone(),
                Arc::new(RoutingQueue::new(Arc::clone(&store))),
                MediatorConfig {
                    endpoint: config.identity.endpoint.clone().unwrap_or_default(),
                    routing_keys: config.mediator.routing_keys.clone(),
                    auto_accept: config.mediator.auto_accept,
                },
            ));
            registry.register_handler(Arc::new(MediatorHandler::new(Arc::clone(&service))))?;
            Some(service)
        } else {
            None
        };

        let (outbound, outbound_rx) = OutboundQueue::new(config.outbound.queue_capacity);
        let worker = OutboundWorker::new(
            outbound_rx,
            Arc::clone(&envelope),
            transport,
            (&config.outbound.retry).into(),
            Duration::from_millis(config.outbound.send_timeout_ms),
            events.clone(),
        );
        tokio::spawn(worker.run());

        let dispatcher = Dispatcher::new(Arc::clone(&registry), events.clone());
        info!(
            label = %config.identity.label,
            mediator = config.mediator.enabled,
            "agent started"
        );
        Ok(Self {
            config,
            store,
            events,
            registry,
            dispatcher,
            outbound,
            envelope,
            connections,
            credentials,
            credential_formats,
            proofs,
            proof_formats,
            mediation,
            basic_messages,
            question_answer,
            action_menu,
            mediator,
        })
    }

    /// Unpack an inbound frame, dispatch it, and queue any reply.
    pub async fn receive(&self, raw: &[u8]) -> SkeinResult<()> {
        let unpacked = self.envelope.unpack(raw).await?;
        let connection = self
            .resolve_connection(unpacked.sender_key.as_deref())
            .await?;
        let mut ctx = InboundContext::new(unpacked.message)
            .with_keys(unpacked.sender_key, unpacked.recipient_key);
        if let Some(connection) = connection {
            ctx = ctx.with_connection(connection);
        }
        if let Some(outbound) = self.dispatcher.dispatch(ctx).await? {
            self.send(outbound).await?;
        }
        Ok(())
    }

    /// Queue an outbound message, addressing it from its connection
    /// record when the caller left the envelope fields empty.
    pub async fn send(&self, mut outbound: OutboundMessage) -> SkeinResult<()> {
        if outbound.endpoint.is_none() {
            if let Some(connection_id) = outbound.connection_id.clone() {
                if let Some(connection) = self
                    .store
                    .get_record::<ConnectionRecord>(&connection_id)
                    .await?
                {
                    outbound.recipient_keys = connection.recipient_keys.clone();
                    outbound.endpoint = connection.endpoint.clone();
                }
            }
        }
        if outbound.sender_key.is_none() {
            outbound.sender_key = self.config.identity.recipient_keys.first().cloned();
        }
        self.outbound.enqueue(outbound).await
    }

    /// The connection whose peer keys include `sender_key`.
    async fn resolve_connection(
        &self,
        sender_key: Option<&str>,
    ) -> SkeinResult<Option<ConnectionRecord>> {
        let Some(sender_key) = sender_key else {
            return Ok(None);
        };
        let mut filter = RecordTags::new();
        filter.insert(format!("{TAG_RECIPIENT_KEY_PREFIX}{sender_key}"), "1".into());
        let mut records: Vec<ConnectionRecord> = self.store.query_records(&filter).await?;
        Ok(records.pop())
    }

    /// Subscribe to agent events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The shared record store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// The handler registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Connection protocol operations.
    pub fn connections(&self) -> &Arc<ConnectionService> {
        &self.connections
    }

    /// Credential protocol operations.
    pub fn credentials(&self) -> &Arc<CredentialService> {
        &self.credentials
    }

    /// Proof protocol operations.
    pub fn proofs(&self) -> &Arc<ProofService> {
        &self.proofs
    }

    /// Recipient-side mediation operations.
    pub fn mediation(&self) -> &Arc<MediationRecipientService> {
        &self.mediation
    }

    /// Basic message operations.
    pub fn basic_messages(&self) -> &Arc<BasicMessageService> {
        &self.basic_messages
    }

    /// Question/answer operations.
    pub fn question_answer(&self) -> &Arc<QuestionAnswerService> {
        &self.question_answer
    }

    /// Action menu operations.
    pub fn action_menu(&self) -> &Arc<ActionMenuService> {
        &self.action_menu
    }

    /// Mediator-side operations, present when `mediator.enabled`.
    pub fn mediator(&self) -> Option<&Arc<MediatorService>> {
        self.mediator.as_ref()
    }

    /// Bind a credential format handler.
    pub fn register_credential_format(
        &self,
        format_id: &str,
        handler: Arc<dyn CredentialFormatHandler>,
    ) -> SkeinResult<()> {
        self.credential_formats.register(format_id, handler)
    }

    /// Bind a proof format handler.
    pub fn register_proof_format(
        &self,
        format_id: &str,
        handler: Arc<dyn ProofFormatHandler>,
    ) -> SkeinResult<()> {
        self.proof_formats.register(format_id, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use skein_engine::{ChannelTransport, StubEnvelope};
    use skein_types::event::EventPayload;
    use skein_types::records::{ConnectionRole, ConnectionState};
    use skein_types::WireMessage;
    use tokio::sync::mpsc;

    const TYPE_PING: &str = "https://didcomm.org/trust-ping/1.0/ping";

    async fn agent() -> (Agent, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (transport, rx) = ChannelTransport::new();
        let config = AgentConfig {
            identity: IdentityConfig {
                label: "Bob".into(),
                did: "did:peer:bob".into(),
                endpoint: Some("mem://bob".into()),
                recipient_keys: vec!["key-bob".into()],
            },
            ..AgentConfig::default()
        };
        let agent = Agent::start(config, Arc::new(StubEnvelope::new()), Arc::new(transport))
            .await
            .unwrap();
        (agent, rx)
    }

    async fn alice_connection(agent: &Agent) -> ConnectionRecord {
        let mut connection = ConnectionRecord::new(
            "t-alice",
            "did:peer:bob",
            ConnectionRole::Responder,
            ConnectionState::Completed,
        );
        connection.their_did = Some("did:peer:alice".into());
        connection.recipient_keys = vec!["key-alice".into()];
        connection.endpoint = Some("mem://alice".into());
        agent.store().save_record(&connection).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_ping_is_answered_over_the_connection() {
        let (agent, mut rx) = agent().await;
        alice_connection(&agent).await;

        let ping = WireMessage::new(TYPE_PING, serde_json::json!({ "response_requested": true }));
        let thread_id = ping.thread_id().to_string();
        let raw = StubEnvelope::new()
            .pack(&ping, &["key-bob".to_string()], Some("key-alice"))
            .await
            .unwrap();
        agent.receive(&raw).await.unwrap();

        let (endpoint, frame) = rx.recv().await.unwrap();
        assert_eq!(endpoint, "mem://alice");
        let unpacked = StubEnvelope::new().unpack(&frame).await.unwrap();
        assert_eq!(
            unpacked.message.message_type,
            "https://didcomm.org/trust-ping/1.0/ping-response"
        );
        assert_eq!(unpacked.message.thread_id(), thread_id);
        // Addressed with the peer's keys and signed with ours.
        assert_eq!(unpacked.sender_key.as_deref(), Some("key-bob"));
        assert_eq!(unpacked.recipient_key.as_deref(), Some("key-alice"));
    }

    #[tokio::test]
    async fn test_reply_without_connection_is_undeliverable() {
        let (agent, _rx) = agent().await;
        let mut events = agent.subscribe();

        let ping = WireMessage::new(TYPE_PING, serde_json::json!({ "response_requested": true }));
        let raw = StubEnvelope::new()
            .pack(&ping, &["key-bob".to_string()], Some("key-stranger"))
            .await
            .unwrap();
        agent.receive(&raw).await.unwrap();

        loop {
            let event = events.recv().await.unwrap();
            if let EventPayload::Undeliverable { attempts, .. } = event.payload {
                assert_eq!(attempts, 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_mediator_registration_is_config_driven() {
        let (agent, _rx) = agent().await;
        assert!(agent.mediator().is_none());
        assert!(agent
            .registry()
            .get("https://didcomm.org/routing/1.0/forward")
            .is_none());

        let (transport, _rx2) = ChannelTransport::new();
        let config = AgentConfig {
            mediator: crate::config::MediatorSection {
                enabled: true,
                auto_accept: true,
                routing_keys: vec![],
            },
            ..AgentConfig::default()
        };
        let mediator_agent =
            Agent::start(config, Arc::new(StubEnvelope::new()), Arc::new(transport))
                .await
                .unwrap();
        assert!(mediator_agent.mediator().is_some());
        assert!(mediator_agent
            .registry()
            .get("https://didcomm.org/routing/1.0/forward")
            .is_some());
    }
}
