//! Inbound message context.

use skein_types::records::ConnectionRecord;
use skein_types::{SkeinError, SkeinResult, WireMessage};

/// One decrypted message together with its envelope metadata and, when
/// resolved, the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundContext {
    /// The decrypted message.
    pub message: WireMessage,
    /// Key the sender packed with, if the envelope was authenticated.
    pub sender_key: Option<String>,
    /// Our key the message was packed for.
    pub recipient_key: Option<String>,
    /// Connection resolved from the sender/recipient key pair.
    pub connection: Option<ConnectionRecord>,
}

impl InboundContext {
    /// Build a context with no resolved connection.
    pub fn new(message: WireMessage) -> Self {
        Self {
            message,
            sender_key: None,
            recipient_key: None,
            connection: None,
        }
    }

    /// Attach envelope key metadata.
    pub fn with_keys(mut self, sender_key: Option<String>, recipient_key: Option<String>) -> Self {
        self.sender_key = sender_key;
        self.recipient_key = recipient_key;
        self
    }

    /// Attach the resolved connection.
    pub fn with_connection(mut self, connection: ConnectionRecord) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Id of the resolved connection, if any.
    pub fn connection_id(&self) -> Option<String> {
        self.connection.as_ref().map(|c| c.id.clone())
    }

    /// The resolved connection, required to be in `completed` state.
    ///
    /// Protocols that only run over an established connection call this
    /// before touching their records.
    pub fn assert_ready_connection(&self) -> SkeinResult<&ConnectionRecord> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            SkeinError::Validation(format!(
                "message '{}' requires a connection",
                self.message.message_type
            ))
        })?;
        if !connection.is_ready() {
            return Err(SkeinError::Validation(format!(
                "connection {} is not ready (state: {})",
                connection.id, connection.state
            )));
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::records::{ConnectionRole, ConnectionState};

    fn ping() -> WireMessage {
        WireMessage::new(
            "https://didcomm.org/trust-ping/1.0/ping",
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_assert_ready_requires_connection() {
        let ctx = InboundContext::new(ping());
        assert!(ctx.assert_ready_connection().is_err());
    }

    #[test]
    fn test_assert_ready_checks_state() {
        let mut connection = ConnectionRecord::new(
            "t-1",
            "did:peer:1",
            ConnectionRole::Responder,
            ConnectionState::RequestReceived,
        );
        let ctx = InboundContext::new(ping()).with_connection(connection.clone());
        assert!(ctx.assert_ready_connection().is_err());

        connection.state = ConnectionState::Completed;
        let ctx = InboundContext::new(ping()).with_connection(connection);
        assert!(ctx.assert_ready_connection().is_ok());
    }
}
