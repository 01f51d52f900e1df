//! Envelope boundary and transport seams.
//!
//! Encryption and wire transport are external collaborators. The engine
//! only needs the two traits below; the stub implementations provide a
//! deterministic envelope for tests and an in-process transport for
//! embedded setups.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use skein_types::{SkeinError, SkeinResult, WireMessage};
use tokio::sync::mpsc;

/// Result of unpacking an inbound envelope.
#[derive(Debug, Clone)]
pub struct UnpackedEnvelope {
    /// The decrypted message.
    pub message: WireMessage,
    /// Key the sender packed with, absent for anonymous envelopes.
    pub sender_key: Option<String>,
    /// Our key the envelope was packed for.
    pub recipient_key: Option<String>,
}

/// Packs and unpacks message envelopes. Failures are transport errors
/// and are not retried by the engine.
#[async_trait]
pub trait EnvelopeBoundary: Send + Sync {
    /// Encrypt a message for the given recipients.
    async fn pack(
        &self,
        message: &WireMessage,
        recipient_keys: &[String],
        sender_key: Option<&str>,
    ) -> SkeinResult<Vec<u8>>;

    /// Decrypt an inbound envelope.
    async fn unpack(&self, raw: &[u8]) -> SkeinResult<UnpackedEnvelope>;
}

/// Sends packed bytes to an endpoint.
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Deliver `raw` to `endpoint`.
    async fn send(&self, endpoint: &str, raw: &[u8]) -> SkeinResult<()>;
}

#[derive(Serialize, Deserialize)]
struct StubFrame {
    recipient_keys: Vec<String>,
    sender_key: Option<String>,
    ciphertext: String,
}

/// Deterministic stand-in for the real crypto boundary: base64 of the
/// message JSON framed with the key metadata. Pack→unpack returns the
/// original message bit-for-bit.
#[derive(Default, Clone)]
pub struct StubEnvelope;

impl StubEnvelope {
    /// Create a stub boundary.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EnvelopeBoundary for StubEnvelope {
    async fn pack(
        &self,
        message: &WireMessage,
        recipient_keys: &[String],
        sender_key: Option<&str>,
    ) -> SkeinResult<Vec<u8>> {
        let plaintext = message.encode()?;
        let frame = StubFrame {
            recipient_keys: recipient_keys.to_vec(),
            sender_key: sender_key.map(str::to_string),
            ciphertext: BASE64.encode(plaintext),
        };
        serde_json::to_vec(&frame).map_err(|e| SkeinError::Transport(e.to_string()))
    }

    async fn unpack(&self, raw: &[u8]) -> SkeinResult<UnpackedEnvelope> {
        let frame: StubFrame =
            serde_json::from_slice(raw).map_err(|e| SkeinError::Transport(e.to_string()))?;
        let plaintext = BASE64
            .decode(&frame.ciphertext)
            .map_err(|e| SkeinError::Transport(e.to_string()))?;
        let message = WireMessage::decode(&plaintext)?;
        Ok(UnpackedEnvelope {
            message,
            sender_key: frame.sender_key,
            recipient_key: frame.recipient_keys.first().cloned(),
        })
    }
}

/// In-process transport that delivers sent frames into an mpsc channel.
/// Used by tests and by embedded agent-to-agent wiring.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its frames arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TransportSender for ChannelTransport {
    async fn send(&self, endpoint: &str, raw: &[u8]) -> SkeinResult<()> {
        self.tx
            .send((endpoint.to_string(), raw.to_vec()))
            .map_err(|_| SkeinError::Transport("transport channel closed".into()))
    }
}
