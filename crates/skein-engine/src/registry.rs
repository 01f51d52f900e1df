//! Message type registry.

use crate::context::InboundContext;
use async_trait::async_trait;
use dashmap::DashMap;
use skein_types::message::PROBLEM_REPORT_TYPE;
use skein_types::{OutboundMessage, SkeinError, SkeinResult};
use std::sync::Arc;

/// What the dispatcher does with a handler failure that is safe to
/// surface (validation, transition miss, peer problem report).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Send a problem report back to the peer.
    Reply,
    /// Log locally and drop; the peer gets nothing.
    #[default]
    LogAndDrop,
}

/// A registered protocol message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The message type URIs this handler accepts.
    fn message_types(&self) -> Vec<String>;

    /// Policy for surfacing handler failures to the peer.
    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::default()
    }

    /// The problem-report type URI this protocol replies with.
    fn problem_report_type(&self) -> &str {
        PROBLEM_REPORT_TYPE
    }

    /// Process one inbound message, optionally producing a reply.
    async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>>;
}

/// Maps message type URIs to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a single type URI to a handler. Fails if the URI is already
    /// bound.
    pub fn register(&self, type_uri: &str, handler: Arc<dyn MessageHandler>) -> SkeinResult<()> {
        match self.handlers.entry(type_uri.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SkeinError::DuplicateHandler(type_uri.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Bind every type URI a handler declares.
    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> SkeinResult<()> {
        for type_uri in handler.message_types() {
            self.register(&type_uri, Arc::clone(&handler))?;
        }
        Ok(())
    }

    /// Look up the handler for a type URI.
    pub fn get(&self, type_uri: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(type_uri).map(|entry| Arc::clone(&entry))
    }

    /// All registered type URIs, sorted. Feeds discover-features.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::WireMessage;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        fn message_types(&self) -> Vec<String> {
            vec!["https://didcomm.org/basicmessage/1.0/message".into()]
        }

        async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
            let reply = WireMessage::reply_to(
                "https://didcomm.org/basicmessage/1.0/message",
                &ctx.message,
                serde_json::Value::Null,
            );
            Ok(Some(OutboundMessage::reply(reply, None)))
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = HandlerRegistry::new();
        registry.register_handler(Arc::new(EchoHandler)).unwrap();
        let err = registry.register_handler(Arc::new(EchoHandler)).unwrap_err();
        assert!(matches!(err, SkeinError::DuplicateHandler(_)));
    }

    #[test]
    fn test_supported_types_sorted() {
        let registry = HandlerRegistry::new();
        registry
            .register("https://didcomm.org/b/1.0/x", Arc::new(EchoHandler))
            .unwrap();
        registry
            .register("https://didcomm.org/a/1.0/y", Arc::new(EchoHandler))
            .unwrap();
        assert_eq!(
            registry.supported_types(),
            vec![
                "https://didcomm.org/a/1.0/y".to_string(),
                "https://didcomm.org/b/1.0/x".to_string(),
            ]
        );
    }
}
