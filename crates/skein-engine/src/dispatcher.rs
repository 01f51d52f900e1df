//! Inbound message dispatch.
//!
//! The dispatcher is the boundary below which no protocol failure may
//! escape uncaught: transition misses and validation failures resolve to
//! either a problem-report reply or a logged drop, per the handler's
//! policy. Storage and transport errors surface to the caller so the
//! transport layer can retry.

use crate::context::InboundContext;
use crate::event_bus::EventBus;
use crate::registry::{FailurePolicy, HandlerRegistry};
use skein_types::event::EventPayload;
use skein_types::message::{CODE_MESSAGE_NOT_SUPPORTED, PROBLEM_REPORT_TYPE};
use skein_types::{OutboundMessage, ProblemReport, SkeinError, SkeinResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Looks up the handler for an inbound message and runs it.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    events: EventBus,
}

impl Dispatcher {
    /// Create a dispatcher over a registry and event bus.
    pub fn new(registry: Arc<HandlerRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// The registry this dispatcher resolves handlers from.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Dispatch one inbound message.
    ///
    /// Returns the handler's reply, a problem report for unsupported or
    /// rejected messages, or nothing. Never blocks on unrelated threads;
    /// any waiting happens inside the handler on its own thread lock.
    pub async fn dispatch(&self, ctx: InboundContext) -> SkeinResult<Option<OutboundMessage>> {
        let type_uri = ctx.message.message_type.clone();
        let thread_id = ctx.message.thread_id().to_string();

        let Some(handler) = self.registry.get(&type_uri) else {
            warn!(%type_uri, %thread_id, "no handler registered");
            let report = ProblemReport::new(
                &thread_id,
                CODE_MESSAGE_NOT_SUPPORTED,
                format!("unsupported message type: {type_uri}"),
            );
            return Ok(Some(OutboundMessage::reply(
                report.to_wire(PROBLEM_REPORT_TYPE),
                ctx.connection_id(),
            )));
        };

        debug!(%type_uri, %thread_id, "dispatching");
        let connection_id = ctx.connection_id();
        match handler.handle(&ctx).await {
            Ok(outbound) => {
                self.events.publish(EventPayload::MessageReceived {
                    message_type: type_uri,
                    thread_id,
                    connection_id,
                });
                Ok(outbound)
            }
            // Persistence and transport failures are retryable by the
            // caller; the transition was not committed.
            Err(err @ (SkeinError::Storage(_) | SkeinError::Transport(_))) => Err(err),
            // A peer's problem report is terminal for its thread; publish
            // it for subscribers and never answer it with another report.
            Err(SkeinError::ProblemReport {
                thread_id,
                code,
                description,
            }) => {
                warn!(%type_uri, %thread_id, %code, "peer reported a problem");
                self.events.publish(EventPayload::ProblemReportReceived {
                    thread_id,
                    code,
                    description,
                });
                Ok(None)
            }
            Err(err) => {
                match handler.failure_policy() {
                    FailurePolicy::Reply => {
                        warn!(%type_uri, %thread_id, error = %err, "handler failed, replying with problem report");
                        let report = ProblemReport::new(
                            &thread_id,
                            failure_code(&err),
                            err.to_string(),
                        );
                        Ok(Some(OutboundMessage::reply(
                            report.to_wire(handler.problem_report_type()),
                            connection_id,
                        )))
                    }
                    FailurePolicy::LogAndDrop => {
                        warn!(%type_uri, %thread_id, error = %err, "handler failed, dropping");
                        Ok(None)
                    }
                }
            }
        }
    }
}

fn failure_code(err: &SkeinError) -> &'static str {
    match err {
        SkeinError::Validation(_) => "invalid-message",
        SkeinError::StateTransition { .. } => "invalid-state",
        _ => "internal-error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MessageHandler;
    use async_trait::async_trait;
    use skein_types::WireMessage;

    struct FailingHandler {
        policy: FailurePolicy,
    }

    #[async_trait]
    impl MessageHandler for FailingHandler {
        fn message_types(&self) -> Vec<String> {
            vec!["https://didcomm.org/connections/1.0/ack".into()]
        }

        fn failure_policy(&self) -> FailurePolicy {
            self.policy
        }

        async fn handle(&self, ctx: &InboundContext) -> SkeinResult<Option<OutboundMessage>> {
            Err(SkeinError::no_record(ctx.message.thread_id(), "ack"))
        }
    }

    fn ack_message() -> WireMessage {
        WireMessage::new(
            "https://didcomm.org/connections/1.0/ack",
            serde_json::Value::Null,
        )
        .with_thread("t-77")
    }

    #[tokio::test]
    async fn test_unknown_type_yields_problem_report() {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(registry, EventBus::default());
        let message = WireMessage::new(
            "https://didcomm.org/unknown-protocol/1.0/whatever",
            serde_json::Value::Null,
        )
        .with_thread("t-1");

        let outbound = dispatcher
            .dispatch(InboundContext::new(message))
            .await
            .unwrap()
            .expect("expected a problem report");
        let json = serde_json::to_value(&outbound.message).unwrap();
        assert_eq!(json["description"]["code"], CODE_MESSAGE_NOT_SUPPORTED);
        assert_eq!(json["~thread"]["thid"], "t-1");
    }

    #[tokio::test]
    async fn test_failure_policy_reply() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_handler(Arc::new(FailingHandler {
                policy: FailurePolicy::Reply,
            }))
            .unwrap();
        let dispatcher = Dispatcher::new(registry, EventBus::default());

        let outbound = dispatcher
            .dispatch(InboundContext::new(ack_message()))
            .await
            .unwrap()
            .expect("expected a problem report");
        let json = serde_json::to_value(&outbound.message).unwrap();
        assert_eq!(json["description"]["code"], "invalid-state");
        assert_eq!(json["~thread"]["thid"], "t-77");
    }

    #[tokio::test]
    async fn test_failure_policy_drop() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_handler(Arc::new(FailingHandler {
                policy: FailurePolicy::LogAndDrop,
            }))
            .unwrap();
        let dispatcher = Dispatcher::new(registry, EventBus::default());

        let outbound = dispatcher
            .dispatch(InboundContext::new(ack_message()))
            .await
            .unwrap();
        assert!(outbound.is_none());
    }
}
