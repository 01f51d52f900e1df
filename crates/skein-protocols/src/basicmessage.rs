//! Basic message protocol: plain text chat over an established
//! connection, stored as history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skein_engine::{InboundContext, MessageHandler};
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::records::BasicMessageRecord;
use skein_types::{OutboundMessage, SkeinResult, WireMessage};
use std::sync::Arc;
use uuid::Uuid;

/// Basic message.
pub const TYPE_BASIC_MESSAGE: &str = "https://didcomm.org/basicmessage/1.0/message";

/// Basic message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicMessage {
    /// Message content.
    pub content: String,
    /// Sender-declared send time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<DateTime<Utc>>,
}

/// Sends and stores basic messages.
pub struct BasicMessageService {
    store: Arc<dyn RecordStore>,
}

impl BasicMessageService {
    /// Build the service over the shared store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Send a message over a connection, storing it in the history.
    pub async fn send(
        &self,
        connection_id: impl Into<String>,
        content: impl Into<String>,
    ) -> SkeinResult<OutboundMessage> {
        let connection_id = connection_id.into();
        let content = content.into();
        let now = Utc::now();
        let message = WireMessage::new(
            TYPE_BASIC_MESSAGE,
            serde_json::to_value(BasicMessage {
                content: content.clone(),
                sent_time: Some(now),
            })?,
        );
        let record = BasicMessageRecord {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.clone(),
            content,
            sent_time: Some(now),
            created_at: now,
        };
        self.store.save_record(&record).await?;
        Ok(OutboundMessage::reply(message, Some(connection_id)))
    }

    /// Stored history for a connection.
    pub async fn history(&self, connection_id: &str) -> SkeinResult<Vec<BasicMessageRecord>> {
        let mut filter = skein_types::records::RecordTags::new();
        filter.insert(
            skein_types::records::TAG_CONNECTION_ID.into(),
            connection_id.to_string(),
        );
        let mut records: Vec<BasicMessageRecord> = self.store.query_records(&filter).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

/// Stores inbound basic messages. Requires a ready connection.
pub struct BasicMessageHandler {
    store: Arc<dyn RecordStore>,
}

impl BasicMessageHandler {
    /// Build the handler over the shared store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl MessageHandler for BasicMessageHandler {
    fn message_types(&self) -> Vec<String> {
        vec![TYPE_BASIC_MESSAGE.into()]
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let connection = ctx.assert_ready_connection()?;
        let body: BasicMessage = ctx.message.body_as()?;
        let record = BasicMessageRecord {
            id: Uuid::new_v4().to_string(),
            connection_id: connection.id.clone(),
            content: body.content,
            sent_time: body.sent_time,
            created_at: Utc::now(),
        };
        self.store.save_record(&record).await?;
        Ok(None)
    }
}
