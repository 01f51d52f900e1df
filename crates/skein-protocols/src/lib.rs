//! Protocol implementations for the Skein agent.
//!
//! Each module owns one protocol: its message type URIs, wire DTOs, the
//! transition table fed to the generic state machine, a service exposing
//! the local operations, and the [`skein_engine::MessageHandler`] that
//! processes inbound messages.

pub mod actionmenu;
pub mod basicmessage;
pub mod connections;
pub mod credentials;
pub mod discovery;
pub mod formats;
pub mod mediation;
pub mod proofs;
pub mod questionanswer;
pub mod trustping;

pub use connections::{ConnectionConfig, ConnectionHandler, ConnectionService};
pub use credentials::{CredentialFormatHandler, CredentialHandler, CredentialService};
pub use formats::FormatRegistry;
pub use mediation::{MediationRecipientHandler, MediationRecipientService};
pub use proofs::{ProofFormatHandler, ProofHandler, ProofService};
