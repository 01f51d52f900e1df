//! Mediator-side mediation, routing and pickup operations.

use crate::queue::RoutingQueue;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use skein_engine::{
    EventBus, Exchange, FailurePolicy, InboundContext, MessageHandler, ThreadLocks,
};
use skein_protocols::mediation::{
    mediation_table, Batch, BatchPickup, BatchedMessage, Forward, KeylistAction, KeylistResult,
    KeylistUpdate, KeylistUpdateResponse, KeylistUpdated, MediateGrant, MediationKind,
    MessagesReceived, TYPE_BATCH, TYPE_BATCH_PICKUP, TYPE_FORWARD, TYPE_KEYLIST_UPDATE,
    TYPE_KEYLIST_UPDATE_RESPONSE, TYPE_MEDIATE_DENY, TYPE_MEDIATE_GRANT, TYPE_MEDIATE_REQUEST,
    TYPE_MESSAGES_RECEIVED, TYPE_PROBLEM_REPORT,
};
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::event::EventPayload;
use skein_types::message::{MessageTypeUri, CODE_UNROUTABLE};
use skein_types::records::{
    MediationRecord, MediationRole, MediationState, QueuedMessage, RecordTags, TAG_CONNECTION_ID,
    TAG_RECIPIENT_KEY_PREFIX, TAG_STATE,
};
use skein_types::{
    OutboundMessage, ProblemReport, SkeinError, SkeinResult, WireMessage,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Mediator policy and grant contents.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Endpoint handed out in grants; senders forward to it.
    pub endpoint: String,
    /// Routing keys handed out in grants, outermost last.
    pub routing_keys: Vec<String>,
    /// Grant every mediation request as it arrives. When false, requests
    /// sit in `requested` until [`MediatorService::grant`] or
    /// [`MediatorService::deny`] is called.
    pub auto_accept: bool,
}

impl MediatorConfig {
    /// Auto-accepting config with no routing keys.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            routing_keys: Vec::new(),
            auto_accept: true,
        }
    }
}

/// Mediation relationships, the keylist, and the routing queue.
pub struct MediatorService {
    exchange: Exchange<MediationRecord, MediationKind>,
    store: Arc<dyn RecordStore>,
    queue: Arc<RoutingQueue>,
    events: EventBus,
    config: MediatorConfig,
}

impl MediatorService {
    /// Build the service over the shared infrastructure.
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
        queue: Arc<RoutingQueue>,
        config: MediatorConfig,
    ) -> Self {
        Self {
            exchange: Exchange::new(mediation_table(), Arc::clone(&store), locks, events.clone()),
            store,
            queue,
            events,
            config,
        }
    }

    /// The routing queue, shared with pickup transports.
    pub fn queue(&self) -> &Arc<RoutingQueue> {
        &self.queue
    }

    /// Look up the mediation record for an exchange thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<MediationRecord>> {
        self.exchange.find(thread_id).await
    }

    /// A recipient asks us to route for them. Auto-accepting mediators
    /// reply with the grant immediately.
    pub async fn process_mediate_request(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let thread_id = ctx.message.thread_id().to_string();
        let connection_id = connection.id.clone();
        self.exchange
            .apply_or_create(&thread_id, MediationKind::Request, || {
                MediationRecord::new(
                    thread_id.clone(),
                    connection_id,
                    MediationRole::Mediator,
                    MediationState::Requested,
                )
            })
            .await?;
        if self.config.auto_accept {
            return Ok(Some(self.grant(ctx.message.thread_id()).await?));
        }
        Ok(None)
    }

    /// Grant a pending mediation request.
    pub async fn grant(&self, thread_id: &str) -> SkeinResult<OutboundMessage> {
        let record = self.exchange.apply(thread_id, MediationKind::Grant).await?;
        info!(thread_id, connection_id = %record.connection_id, "mediation granted");
        let message = WireMessage::new(
            TYPE_MEDIATE_GRANT,
            serde_json::to_value(MediateGrant {
                endpoint: self.config.endpoint.clone(),
                routing_keys: self.config.routing_keys.clone(),
            })?,
        )
        .with_thread(thread_id.to_string());
        Ok(OutboundMessage::reply(message, Some(record.connection_id)))
    }

    /// Deny a pending mediation request.
    pub async fn deny(&self, thread_id: &str) -> SkeinResult<OutboundMessage> {
        let record = self.exchange.apply(thread_id, MediationKind::Deny).await?;
        let message = WireMessage::new(TYPE_MEDIATE_DENY, serde_json::Value::Null)
            .with_thread(thread_id.to_string());
        Ok(OutboundMessage::reply(message, Some(record.connection_id)))
    }

    /// Apply a recipient's keylist changes and report each outcome.
    /// Requires a granted relationship.
    pub async fn process_keylist_update(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let body: KeylistUpdate = ctx.message.body_as()?;
        let thread_id = ctx.message.thread_id();
        let record = self
            .exchange
            .find(thread_id)
            .await?
            .ok_or_else(|| SkeinError::no_record(thread_id, "keylist-update"))?;
        if !record.is_ready() {
            return Err(SkeinError::StateTransition {
                thread_id: thread_id.to_string(),
                state: record.state.to_string(),
                trigger: "keylist-update".to_string(),
            });
        }
        let mut updated = Vec::with_capacity(body.updates.len());
        let record = self
            .exchange
            .mutate(thread_id, |record| {
                for item in body.updates {
                    let changed = match item.action {
                        KeylistAction::Add => record.add_recipient_key(item.recipient_key.clone()),
                        KeylistAction::Remove => record.remove_recipient_key(&item.recipient_key),
                    };
                    updated.push(KeylistUpdated {
                        recipient_key: item.recipient_key,
                        action: item.action,
                        result: if changed {
                            KeylistResult::Success
                        } else {
                            KeylistResult::NoChange
                        },
                    });
                }
            })
            .await?;
        let response = WireMessage::reply_to(
            TYPE_KEYLIST_UPDATE_RESPONSE,
            &ctx.message,
            serde_json::to_value(KeylistUpdateResponse { updated })?,
        );
        Ok(Some(OutboundMessage::reply(
            response,
            Some(record.connection_id),
        )))
    }

    /// Queue a forwarded payload for a mediated recipient key. The key
    /// must be on the keylist of a granted relationship.
    pub async fn process_forward(&self, message: &WireMessage) -> SkeinResult<QueuedMessage> {
        let body: Forward = message.body_as()?;
        let payload = BASE64
            .decode(&body.payload)
            .map_err(|e| SkeinError::Validation(format!("forward payload is not base64: {e}")))?;

        let record = self
            .keylist_holder(&body.to)
            .await?
            .ok_or_else(|| {
                warn!(recipient_key = %body.to, "forward for a key on no active keylist");
                SkeinError::no_record(message.thread_id(), "forward")
            })?;

        let queued = self.queue.enqueue(&body.to, payload).await?;
        self.events.publish(EventPayload::MediationQueued {
            recipient_key: body.to,
            message_id: queued.id.clone(),
            delivery_strategy: record.delivery_strategy.to_string(),
        });
        Ok(queued)
    }

    /// Return up to `batch_size` of the oldest queued messages across the
    /// requesting recipient's keylist. Non-destructive.
    pub async fn process_batch_pickup(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: BatchPickup = ctx.message.body_as()?;
        let record = self
            .granted_for_connection(&connection.id, ctx.message.thread_id(), "batch-pickup")
            .await?;

        let mut messages = Vec::new();
        for key in &record.recipient_keys {
            let remaining = body.batch_size.saturating_sub(messages.len());
            if remaining == 0 {
                break;
            }
            for queued in self.queue.pickup(key, remaining).await? {
                messages.push(BatchedMessage {
                    id: queued.id,
                    payload: BASE64.encode(queued.encrypted_payload),
                });
            }
        }
        let batch = WireMessage::reply_to(
            TYPE_BATCH,
            &ctx.message,
            serde_json::to_value(Batch { messages })?,
        );
        Ok(Some(OutboundMessage::reply(batch, Some(connection.id.clone()))))
    }

    /// Remove messages the recipient confirmed, completing delivery.
    pub async fn process_messages_received(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: MessagesReceived = ctx.message.body_as()?;
        let record = self
            .granted_for_connection(&connection.id, ctx.message.thread_id(), "messages-received")
            .await?;
        let mut removed = 0;
        for key in &record.recipient_keys {
            removed += self.queue.acknowledge(key, &body.message_id_list).await?;
        }
        info!(connection_id = %connection.id, removed, "delivery acknowledged");
        Ok(None)
    }

    /// The granted relationship whose keylist contains `recipient_key`.
    async fn keylist_holder(&self, recipient_key: &str) -> SkeinResult<Option<MediationRecord>> {
        let mut filter = RecordTags::new();
        filter.insert(
            format!("{TAG_RECIPIENT_KEY_PREFIX}{recipient_key}"),
            "1".into(),
        );
        filter.insert(TAG_STATE.into(), MediationState::Granted.to_string());
        filter.insert("role".into(), MediationRole::Mediator.to_string());
        let mut records: Vec<MediationRecord> = self.store.query_records(&filter).await?;
        Ok(records.pop())
    }

    async fn granted_for_connection(
        &self,
        connection_id: &str,
        thread_id: &str,
        trigger: &str,
    ) -> SkeinResult<MediationRecord> {
        let mut filter = RecordTags::new();
        filter.insert(TAG_CONNECTION_ID.into(), connection_id.to_string());
        filter.insert("role".into(), MediationRole::Mediator.to_string());
        filter.insert(TAG_STATE.into(), MediationState::Granted.to_string());
        let mut records: Vec<MediationRecord> = self.store.query_records(&filter).await?;
        records.pop().ok_or_else(|| SkeinError::StateTransition {
            thread_id: thread_id.to_string(),
            state: "none".to_string(),
            trigger: trigger.to_string(),
        })
    }
}

/// Inbound handler for the mediator side: mediation coordination,
/// forwards, and pickup.
pub struct MediatorHandler {
    service: Arc<MediatorService>,
}

impl MediatorHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<MediatorService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for MediatorHandler {
    fn message_types(&self) -> Vec<String> {
        vec![
            TYPE_MEDIATE_REQUEST.into(),
            TYPE_KEYLIST_UPDATE.into(),
            TYPE_FORWARD.into(),
            TYPE_BATCH_PICKUP.into(),
            TYPE_MESSAGES_RECEIVED.into(),
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
            ("coordinate-mediation", "mediate-request") => {
                self.service.process_mediate_request(ctx).await
            }
            ("coordinate-mediation", "keylist-update") => {
                self.service.process_keylist_update(ctx).await
            }
            ("routing", "forward") => match self.service.process_forward(&ctx.message).await {
                Ok(_) => Ok(None),
                Err(err @ SkeinError::StateTransition { .. }) => {
                    // A forward carries no return route worth a generic
                    // failure reply; name the unroutable key explicitly.
                    let report = ProblemReport::new(
                        ctx.message.thread_id(),
                        CODE_UNROUTABLE,
                        err.to_string(),
                    );
                    let wire = report.to_wire(self.problem_report_type());
                    Ok(Some(OutboundMessage::reply(wire, ctx.connection_id())))
                }
                Err(err) => Err(err),
            },
            ("messagepickup", "batch-pickup") => self.service.process_batch_pickup(ctx).await,
            ("messagepickup", "messages-received") => {
                self.service.process_messages_received(ctx).await
            }
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}
