//! Core types and traits for the Skein protocol engine.
//!
//! Everything shared between the engine, the per-protocol crates and the
//! mediator lives here: the wire message model, the record model, the
//! event payloads and the shared error taxonomy.

pub mod error;
pub mod event;
pub mod message;
pub mod records;

pub use error::{SkeinError, SkeinResult};
pub use message::{MessageTypeUri, OutboundMessage, ProblemReport, ThreadDecorator, WireMessage};
