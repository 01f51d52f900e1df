//! Trust ping protocol.

use serde::{Deserialize, Serialize};
use skein_engine::{InboundContext, MessageHandler};
use skein_types::{OutboundMessage, SkeinResult, WireMessage};
use tracing::debug;

/// Ping.
pub const TYPE_PING: &str = "https://didcomm.org/trust-ping/1.0/ping";
/// Ping response.
pub const TYPE_PING_RESPONSE: &str = "https://didcomm.org/trust-ping/1.0/ping-response";

fn default_response_requested() -> bool {
    true
}

/// Ping body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Whether the sender expects a response. Defaults to true.
    #[serde(default = "default_response_requested")]
    pub response_requested: bool,
    /// Free-text comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Build a ping to send over a connection.
pub fn ping(connection_id: impl Into<String>, comment: Option<String>) -> OutboundMessage {
    let message = WireMessage::new(
        TYPE_PING,
        serde_json::json!({ "response_requested": true, "comment": comment }),
    );
    OutboundMessage::reply(message, Some(connection_id.into()))
}

/// Replies to pings on the same thread when a response is requested.
#[derive(Default)]
pub struct TrustPingHandler;

#[async_trait::async_trait]
impl MessageHandler for TrustPingHandler {
    fn message_types(&self) -> Vec<String> {
        vec![TYPE_PING.into(), TYPE_PING_RESPONSE.into()]
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        if ctx.message.message_type == TYPE_PING_RESPONSE {
            debug!(thread_id = ctx.message.thread_id(), "ping response received");
            return Ok(None);
        }
        let body: Ping = ctx.message.body_as()?;
        if !body.response_requested {
            return Ok(None);
        }
        let response =
            WireMessage::reply_to(TYPE_PING_RESPONSE, &ctx.message, serde_json::Value::Null);
        Ok(Some(OutboundMessage::reply(response, ctx.connection_id())))
    }
}
