//! Outbound delivery queue.
//!
//! Messages awaiting encryption and send sit in an mpsc queue consumed
//! by a worker task. Each send carries a timeout and a bounded retry
//! budget; exhaustion emits `Undeliverable` on the event bus rather
//! than dropping silently.

use crate::envelope::{EnvelopeBoundary, TransportSender};
use crate::event_bus::EventBus;
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use skein_types::event::EventPayload;
use skein_types::{OutboundMessage, SkeinError, SkeinResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Producer half of the outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundQueue {
    /// Create a queue with the given capacity, returning the receiver
    /// for an [`OutboundWorker`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a message for packing and delivery.
    pub async fn enqueue(&self, outbound: OutboundMessage) -> SkeinResult<()> {
        self.tx
            .send(outbound)
            .await
            .map_err(|_| SkeinError::Transport("outbound queue closed".into()))
    }
}

/// Consumes the outbound queue: packs, sends, retries, reports.
pub struct OutboundWorker {
    rx: mpsc::Receiver<OutboundMessage>,
    envelope: Arc<dyn EnvelopeBoundary>,
    transport: Arc<dyn TransportSender>,
    retry: RetryConfig,
    send_timeout: Duration,
    events: EventBus,
}

impl OutboundWorker {
    /// Build a worker over the queue receiver and the external seams.
    pub fn new(
        rx: mpsc::Receiver<OutboundMessage>,
        envelope: Arc<dyn EnvelopeBoundary>,
        transport: Arc<dyn TransportSender>,
        retry: RetryConfig,
        send_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            rx,
            envelope,
            transport,
            retry,
            send_timeout,
            events,
        }
    }

    /// Drain the queue until all producers hang up.
    pub async fn run(mut self) {
        while let Some(outbound) = self.rx.recv().await {
            self.deliver(outbound).await;
        }
        debug!("outbound queue closed, worker exiting");
    }

    /// Pack and send one message, retrying per the configured budget.
    pub async fn deliver(&self, outbound: OutboundMessage) {
        let message_id = outbound.message.id.clone();
        let Some(endpoint) = outbound.endpoint.clone() else {
            warn!(%message_id, "outbound message has no endpoint");
            self.undeliverable(&message_id, "", 0);
            return;
        };

        // Pack failures are not retried: a message that cannot be
        // encrypted now will not encrypt better later.
        let raw = match self
            .envelope
            .pack(
                &outbound.message,
                &outbound.recipient_keys,
                outbound.sender_key.as_deref(),
            )
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%message_id, error = %err, "pack failed");
                self.undeliverable(&message_id, &endpoint, 0);
                return;
            }
        };

        let outcome = retry_async(&self.retry, || {
            let raw = raw.clone();
            let endpoint = endpoint.clone();
            async move {
                match tokio::time::timeout(
                    self.send_timeout,
                    self.transport.send(&endpoint, &raw),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SkeinError::Transport(format!(
                        "send to {endpoint} timed out"
                    ))),
                }
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { attempts, .. } => {
                debug!(%message_id, %endpoint, attempts, "delivered");
            }
            RetryOutcome::Exhausted { attempts, .. } => {
                self.undeliverable(&message_id, &endpoint, attempts);
            }
        }
    }

    fn undeliverable(&self, message_id: &str, endpoint: &str, attempts: u32) {
        self.events.publish(EventPayload::Undeliverable {
            message_id: message_id.to_string(),
            endpoint: endpoint.to_string(),
            attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ChannelTransport, StubEnvelope};
    use async_trait::async_trait;
    use skein_types::WireMessage;

    struct DeadTransport;

    #[async_trait]
    impl TransportSender for DeadTransport {
        async fn send(&self, _endpoint: &str, _raw: &[u8]) -> SkeinResult<()> {
            Err(SkeinError::Transport("connection refused".into()))
        }
    }

    fn outbound_to(endpoint: Option<&str>) -> OutboundMessage {
        let message = WireMessage::new(
            "https://didcomm.org/trust-ping/1.0/ping",
            serde_json::Value::Null,
        );
        let mut out = OutboundMessage::reply(message, None);
        out.recipient_keys = vec!["key-peer".to_string()];
        out.endpoint = endpoint.map(str::to_string);
        out
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            min_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_delivery_reaches_transport() {
        let (transport, mut rx) = ChannelTransport::new();
        let (queue, worker_rx) = OutboundQueue::new(8);
        let bus = EventBus::default();
        let worker = OutboundWorker::new(
            worker_rx,
            Arc::new(StubEnvelope::new()),
            Arc::new(transport),
            fast_retry(),
            Duration::from_secs(1),
            bus,
        );
        tokio::spawn(worker.run());

        queue.enqueue(outbound_to(Some("mem://bob"))).await.unwrap();
        let (endpoint, raw) = rx.recv().await.unwrap();
        assert_eq!(endpoint, "mem://bob");
        let unpacked = StubEnvelope::new().unpack(&raw).await.unwrap();
        assert_eq!(
            unpacked.message.message_type,
            "https://didcomm.org/trust-ping/1.0/ping"
        );
    }

    #[tokio::test]
    async fn test_exhaustion_emits_undeliverable() {
        let (queue, worker_rx) = OutboundQueue::new(8);
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let worker = OutboundWorker::new(
            worker_rx,
            Arc::new(StubEnvelope::new()),
            Arc::new(DeadTransport),
            fast_retry(),
            Duration::from_secs(1),
            bus,
        );
        tokio::spawn(worker.run());

        let outbound = outbound_to(Some("mem://gone"));
        let message_id = outbound.message.id.clone();
        queue.enqueue(outbound).await.unwrap();

        let event = events.recv().await.unwrap();
        match event.payload {
            EventPayload::Undeliverable {
                message_id: id,
                endpoint,
                attempts,
            } => {
                assert_eq!(id, message_id);
                assert_eq!(endpoint, "mem://gone");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_undeliverable() {
        let (queue, worker_rx) = OutboundQueue::new(8);
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let (transport, _rx) = ChannelTransport::new();
        let worker = OutboundWorker::new(
            worker_rx,
            Arc::new(StubEnvelope::new()),
            Arc::new(transport),
            fast_retry(),
            Duration::from_secs(1),
            bus,
        );
        tokio::spawn(worker.run());

        queue.enqueue(outbound_to(None)).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::Undeliverable { attempts: 0, .. }
        ));
    }
}
