//! Mediator side of store-and-forward routing.
//!
//! A mediator accepts mediation requests from recipients that are not
//! directly reachable, keeps a keylist of recipient keys per granted
//! relationship, buffers forwarded messages in a durable
//! [`RoutingQueue`](queue::RoutingQueue), and hands them out through
//! batch pickup. Delivery is at-least-once: pickup never removes a
//! message, only an explicit acknowledgment does.

pub mod queue;
pub mod service;

pub use queue::RoutingQueue;
pub use service::{MediatorConfig, MediatorHandler, MediatorService};
