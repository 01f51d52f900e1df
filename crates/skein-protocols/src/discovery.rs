//! Discover-features protocol: a peer queries which protocols this
//! agent supports; the answer is derived from the handler registry.

use serde::{Deserialize, Serialize};
use skein_engine::{HandlerRegistry, InboundContext, MessageHandler};
use skein_types::message::MessageTypeUri;
use skein_types::{OutboundMessage, SkeinResult, WireMessage};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Feature query.
pub const TYPE_QUERY: &str = "https://didcomm.org/discover-features/1.0/query";
/// Feature disclosure.
pub const TYPE_DISCLOSE: &str = "https://didcomm.org/discover-features/1.0/disclose";

/// Query body. The query is a protocol URI, optionally ending in `*`
/// for prefix matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// The protocol URI pattern.
    pub query: String,
}

/// One disclosed protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Protocol URI, without the message name.
    pub pid: String,
}

/// Disclosure body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disclose {
    /// Protocols matching the query.
    pub protocols: Vec<ProtocolDescriptor>,
}

/// Answers feature queries from the registry's registered types.
pub struct DiscoverFeaturesHandler {
    registry: Arc<HandlerRegistry>,
}

impl DiscoverFeaturesHandler {
    /// Wrap the registry the dispatcher resolves handlers from.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Protocol URIs supported by this agent, sorted and deduplicated.
    pub fn supported_protocols(&self) -> Vec<String> {
        self.registry
            .supported_types()
            .iter()
            .filter_map(|uri| MessageTypeUri::from_str(uri).ok())
            .map(|uri| uri.protocol_uri())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn matches(pattern: &str, protocol_uri: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => protocol_uri.starts_with(prefix),
            None => protocol_uri == pattern,
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for DiscoverFeaturesHandler {
    fn message_types(&self) -> Vec<String> {
        vec![TYPE_QUERY.into(), TYPE_DISCLOSE.into()]
    }

    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        if ctx.message.message_type == TYPE_DISCLOSE {
            debug!(thread_id = ctx.message.thread_id(), "disclosure received");
            return Ok(None);
        }
        let body: Query = ctx.message.body_as()?;
        let protocols = self
            .supported_protocols()
            .into_iter()
            .filter(|p| Self::matches(&body.query, p))
            .map(|pid| ProtocolDescriptor { pid })
            .collect();
        let disclose = WireMessage::reply_to(
            TYPE_DISCLOSE,
            &ctx.message,
            serde_json::to_value(Disclose { protocols })?,
        );
        Ok(Some(OutboundMessage::reply(disclose, ctx.connection_id())))
    }
}
