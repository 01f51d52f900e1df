//! Top-level agent context.
//!
//! Loads configuration, installs tracing, and assembles the store,
//! engine and protocol handlers into a running [`Agent`] with an
//! outbound delivery worker. The envelope and transport seams stay
//! pluggable so the same wiring serves tests, embedded agents and real
//! deployments.

pub mod agent;
pub mod config;
pub mod telemetry;

pub use agent::Agent;
pub use config::{load_config, AgentConfig, IdentityConfig, MediatorSection, StorageBackend};
pub use telemetry::init_tracing;
