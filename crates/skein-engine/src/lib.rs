//! Dispatch, state machine and outbound delivery core.
//!
//! The engine receives decrypted messages wrapped in an
//! [`InboundContext`], resolves a handler through the
//! [`HandlerRegistry`], and lets per-protocol state machines advance
//! their durable exchange records under a per-thread lock. Outbound
//! replies flow through the [`OutboundQueue`] which packs, sends and
//! retries with backoff.

pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod event_bus;
pub mod lock;
pub mod machine;
pub mod outbound;
pub mod registry;
pub mod retry;

pub use context::InboundContext;
pub use dispatcher::Dispatcher;
pub use envelope::{
    ChannelTransport, EnvelopeBoundary, StubEnvelope, TransportSender, UnpackedEnvelope,
};
pub use event_bus::{EventBus, EventReceiver};
pub use lock::ThreadLocks;
pub use machine::{Exchange, TransitionTable};
pub use outbound::{OutboundQueue, OutboundWorker};
pub use registry::{FailurePolicy, HandlerRegistry, MessageHandler};
pub use retry::{retry_async, RetryConfig, RetryOutcome};
