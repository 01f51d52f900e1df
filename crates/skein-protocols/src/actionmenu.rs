//! Action menu protocol: a peer offers a menu of named actions, the
//! requester performs one. One active menu session per connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use skein_engine::{EventBus, FailurePolicy, InboundContext, MessageHandler, ThreadLocks};
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::event::EventPayload;
use skein_types::message::MessageTypeUri;
use skein_types::records::{
    ActionMenuRecord, ActionMenuState, BaseRecord, RecordTags, TAG_CONNECTION_ID,
};
use skein_types::{OutboundMessage, SkeinError, SkeinResult, WireMessage};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Menu request.
pub const TYPE_MENU_REQUEST: &str = "https://didcomm.org/action-menu/1.0/menu-request";
/// Menu.
pub const TYPE_MENU: &str = "https://didcomm.org/action-menu/1.0/menu";
/// Perform a menu action.
pub const TYPE_PERFORM: &str = "https://didcomm.org/action-menu/1.0/perform";

const PROTOCOL: &str = "action-menu";

/// One selectable menu entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuOption {
    /// Action name, echoed in the perform message.
    pub name: String,
    /// Display title.
    pub title: String,
    /// Longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Menu body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Menu {
    /// Menu title.
    pub title: String,
    /// Longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Selectable entries.
    pub options: Vec<MenuOption>,
}

/// Perform body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Perform {
    /// Name of the chosen option.
    pub name: String,
    /// Action parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

/// Action menu operations. The optional configured [`Menu`] makes this
/// agent a provider: it answers menu requests with that menu.
pub struct ActionMenuService {
    store: Arc<dyn RecordStore>,
    locks: Arc<ThreadLocks>,
    events: EventBus,
    menu: Option<Menu>,
}

impl ActionMenuService {
    /// Build the service; pass a menu to act as provider.
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
        menu: Option<Menu>,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            menu,
        }
    }

    fn lock_key(connection_id: &str) -> String {
        format!("{PROTOCOL}/{connection_id}")
    }

    /// The active menu session for a connection, if any.
    pub async fn active_session(
        &self,
        connection_id: &str,
    ) -> SkeinResult<Option<ActionMenuRecord>> {
        let mut filter = RecordTags::new();
        filter.insert(TAG_CONNECTION_ID.into(), connection_id.to_string());
        let mut sessions: Vec<ActionMenuRecord> = self.store.query_records(&filter).await?;
        sessions.retain(|s| s.state != ActionMenuState::Done);
        Ok(sessions.pop())
    }

    /// Ask the peer for its menu, opening a session. An existing active
    /// session for the connection is replaced.
    pub async fn request_menu(
        &self,
        connection_id: impl Into<String>,
    ) -> SkeinResult<(ActionMenuRecord, OutboundMessage)> {
        let connection_id = connection_id.into();
        let _guard = self.locks.acquire(&Self::lock_key(&connection_id)).await;
        if let Some(stale) = self.active_session(&connection_id).await? {
            self.store
                .delete(ActionMenuRecord::RECORD_TYPE, &stale.id)
                .await?;
        }
        let message = WireMessage::new(TYPE_MENU_REQUEST, serde_json::Value::Null);
        let record = ActionMenuRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: message.thread_id().to_string(),
            connection_id: connection_id.clone(),
            state: ActionMenuState::AwaitingMenu,
            title: None,
            options: Vec::new(),
            created_at: Utc::now(),
        };
        self.store.save_record(&record).await?;
        self.emit(&record, None);
        Ok((record, OutboundMessage::reply(message, Some(connection_id))))
    }

    /// Provider side: answer a menu request with the configured menu.
    pub async fn process_menu_request(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        ctx.assert_ready_connection()?;
        let menu = self.menu.as_ref().ok_or_else(|| {
            SkeinError::Validation("this agent does not offer an action menu".into())
        })?;
        let reply =
            WireMessage::reply_to(TYPE_MENU, &ctx.message, serde_json::to_value(menu)?);
        Ok(Some(OutboundMessage::reply(reply, ctx.connection_id())))
    }

    /// Requester side: the menu arrived for our session.
    pub async fn process_menu(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: Menu = ctx.message.body_as()?;
        let _guard = self.locks.acquire(&Self::lock_key(&connection.id)).await;
        let mut record = self
            .active_session(&connection.id)
            .await?
            .ok_or_else(|| SkeinError::StateTransition {
                thread_id: ctx.message.thread_id().to_string(),
                state: "none".to_string(),
                trigger: "menu".to_string(),
            })?;
        let previous = record.state;
        record.title = Some(body.title);
        record.options = body.options.into_iter().map(|o| o.name).collect();
        record.state = ActionMenuState::PreparingSelection;
        self.store.update_record(&record).await?;
        self.emit(&record, Some(previous));
        Ok(None)
    }

    /// Perform one of the received menu's options, closing the session.
    pub async fn perform(
        &self,
        connection_id: &str,
        option_name: &str,
        params: Map<String, Value>,
    ) -> SkeinResult<OutboundMessage> {
        let _guard = self.locks.acquire(&Self::lock_key(connection_id)).await;
        let mut record = self
            .active_session(connection_id)
            .await?
            .ok_or_else(|| SkeinError::RecordNotFound(connection_id.to_string()))?;
        if record.state != ActionMenuState::PreparingSelection {
            return Err(SkeinError::StateTransition {
                thread_id: record.thread_id.clone(),
                state: record.state.to_string(),
                trigger: "perform".to_string(),
            });
        }
        if !record.options.iter().any(|o| o == option_name) {
            return Err(SkeinError::Validation(format!(
                "'{option_name}' is not an option of the active menu"
            )));
        }
        let message = WireMessage::new(
            TYPE_PERFORM,
            serde_json::to_value(Perform {
                name: option_name.to_string(),
                params,
            })?,
        )
        .with_thread(record.thread_id.clone());
        let previous = record.state;
        record.state = ActionMenuState::Done;
        self.store.update_record(&record).await?;
        self.emit(&record, Some(previous));
        Ok(OutboundMessage::reply(message, Some(connection_id.to_string())))
    }

    /// Provider side: a perform arrived. Validated against the offered
    /// menu; the application reacts via the event bus.
    pub async fn process_perform(
        &self,
        ctx: &InboundContext,
    ) -> SkeinResult<Option<OutboundMessage>> {
        ctx.assert_ready_connection()?;
        let body: Perform = ctx.message.body_as()?;
        let menu = self.menu.as_ref().ok_or_else(|| {
            SkeinError::Validation("this agent does not offer an action menu".into())
        })?;
        if !menu.options.iter().any(|o| o.name == body.name) {
            return Err(SkeinError::Validation(format!(
                "'{}' is not an offered action",
                body.name
            )));
        }
        Ok(None)
    }

    fn emit(&self, record: &ActionMenuRecord, previous: Option<ActionMenuState>) {
        self.events.publish(EventPayload::StateChanged {
            protocol: PROTOCOL.to_string(),
            record_id: record.id.clone(),
            thread_id: record.thread_id.clone(),
            previous_state: previous.map(|s| s.to_string()),
            new_state: record.state.to_string(),
        });
    }
}

/// Inbound handler for the action menu protocol.
pub struct ActionMenuHandler {
    service: Arc<ActionMenuService>,
}

impl ActionMenuHandler {
    /// Wrap the service for registration.
    pub fn new(service: Arc<ActionMenuService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl MessageHandler for ActionMenuHandler {
    fn message_types(&self) -> Vec<String> {
        vec![TYPE_MENU_REQUEST.into(), TYPE_MENU.into(), TYPE_PERFORM.into()]
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Reply
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let uri = MessageTypeUri::from_str(&ctx.message.message_type)?;
        match uri.name.as_str() {
            "menu-request" => self.service.process_menu_request(ctx).await,
            "menu" => self.service.process_menu(ctx).await,
            "perform" => self.service.process_perform(ctx).await,
            _ => Err(SkeinError::Validation(format!(
                "unexpected message type: {}",
                ctx.message.message_type
            ))),
        }
    }
}
