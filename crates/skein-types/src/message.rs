//! Wire message model.
//!
//! All agent-to-agent communication uses JSON messages carrying a
//! `@type` URI, an `@id` and an optional `~thread` decorator that
//! correlates every message belonging to one exchange.

use crate::error::{SkeinError, SkeinResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The `~thread` decorator correlating messages of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadDecorator {
    /// Thread id. Immutable once set for an exchange.
    pub thid: String,
    /// Parent thread id, set when a sub-protocol is spawned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

/// A decrypted application-level message.
///
/// Protocol-specific fields are kept as a flattened JSON map and
/// deserialized into typed DTOs by the owning protocol via [`WireMessage::body_as`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message type URI, e.g. `https://didcomm.org/trust-ping/1.0/ping`.
    #[serde(rename = "@type")]
    pub message_type: String,
    /// Unique message id.
    #[serde(rename = "@id")]
    pub id: String,
    /// Thread decorator. Absent on the first message of an exchange.
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadDecorator>,
    /// Protocol-specific fields.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl WireMessage {
    /// Create a new message with a fresh id and no thread decorator.
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("content".to_string(), other);
                map
            }
        };
        Self {
            message_type: message_type.into(),
            id: Uuid::new_v4().to_string(),
            thread: None,
            body,
        }
    }

    /// Attach a thread id.
    pub fn with_thread(mut self, thid: impl Into<String>) -> Self {
        self.thread = Some(ThreadDecorator {
            thid: thid.into(),
            pthid: None,
        });
        self
    }

    /// Attach a parent thread id (sub-protocol correlation).
    pub fn with_parent_thread(mut self, pthid: impl Into<String>) -> Self {
        let thid = self.thread_id().to_string();
        self.thread = Some(ThreadDecorator {
            thid,
            pthid: Some(pthid.into()),
        });
        self
    }

    /// Build a reply on the same thread as `parent`.
    pub fn reply_to(message_type: impl Into<String>, parent: &WireMessage, body: Value) -> Self {
        Self::new(message_type, body).with_thread(parent.thread_id())
    }

    /// The thread id: the `~thread.thid` if present, otherwise `@id`.
    pub fn thread_id(&self) -> &str {
        self.thread.as_ref().map(|t| t.thid.as_str()).unwrap_or(&self.id)
    }

    /// The parent thread id, if any.
    pub fn parent_thread_id(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|t| t.pthid.as_deref())
    }

    /// Deserialize the protocol-specific body into a typed DTO.
    pub fn body_as<T: DeserializeOwned>(&self) -> SkeinResult<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| SkeinError::Validation(format!("{}: {e}", self.message_type)))
    }

    /// Encode to JSON bytes.
    pub fn encode(&self) -> SkeinResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Decode from JSON bytes, validating the type URI.
    pub fn decode(raw: &[u8]) -> SkeinResult<Self> {
        let message: WireMessage = serde_json::from_slice(raw)?;
        MessageTypeUri::from_str(&message.message_type)?;
        Ok(message)
    }
}

/// A parsed message type URI.
///
/// Format: `https://didcomm.org/<protocol>/<major.minor>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageTypeUri {
    /// Protocol family, e.g. `connections`.
    pub protocol: String,
    /// Protocol version, e.g. `1.0`.
    pub version: String,
    /// Message name within the protocol, e.g. `request`.
    pub name: String,
}

/// URI prefix shared by all message types.
pub const TYPE_URI_PREFIX: &str = "https://didcomm.org";

impl MessageTypeUri {
    /// The protocol URI without the message name, e.g.
    /// `https://didcomm.org/connections/1.0`.
    pub fn protocol_uri(&self) -> String {
        format!("{TYPE_URI_PREFIX}/{}/{}", self.protocol, self.version)
    }
}

impl FromStr for MessageTypeUri {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(TYPE_URI_PREFIX)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| SkeinError::Validation(format!("invalid message type URI: {s}")))?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(protocol), Some(version), Some(name), None)
                if !protocol.is_empty() && !version.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    protocol: protocol.to_string(),
                    version: version.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(SkeinError::Validation(format!(
                "invalid message type URI: {s}"
            ))),
        }
    }
}

impl fmt::Display for MessageTypeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TYPE_URI_PREFIX}/{}/{}/{}",
            self.protocol, self.version, self.name
        )
    }
}

/// Message type URI for problem reports not owned by a specific protocol.
pub const PROBLEM_REPORT_TYPE: &str = "https://didcomm.org/notification/1.0/problem-report";

/// Problem code for a message type with no registered handler.
pub const CODE_MESSAGE_NOT_SUPPORTED: &str = "message-not-supported";

/// Problem code for a forward to a key absent from every active keylist.
pub const CODE_UNROUTABLE: &str = "unroutable";

/// A protocol-level error signal, always terminal for its thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Thread the failure is correlated to.
    pub thread_id: String,
    /// Machine-readable problem code.
    pub code: String,
    /// Human-readable description.
    pub description: String,
}

impl ProblemReport {
    /// Create a problem report.
    pub fn new(
        thread_id: impl Into<String>,
        code: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            code: code.into(),
            description: description.into(),
        }
    }

    /// Render as a wire message of the given problem-report type.
    ///
    /// Wire shape: `{"@type": ..., "~thread": {"thid": ...},
    /// "description": {"en": ..., "code": ...}}`.
    pub fn to_wire(&self, type_uri: &str) -> WireMessage {
        WireMessage::new(
            type_uri,
            serde_json::json!({
                "description": { "en": self.description, "code": self.code }
            }),
        )
        .with_thread(self.thread_id.clone())
    }

    /// Parse from an inbound wire message.
    pub fn from_wire(message: &WireMessage) -> SkeinResult<Self> {
        let description = message
            .body
            .get("description")
            .ok_or_else(|| SkeinError::Validation("problem report missing description".into()))?;
        let code = description
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unspecified")
            .to_string();
        let text = description
            .get("en")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            thread_id: message.thread_id().to_string(),
            code,
            description: text,
        })
    }
}

/// A message ready for packing and sending, with its routing metadata.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// The message to pack.
    pub message: WireMessage,
    /// Connection this reply belongs to, when one is resolved.
    pub connection_id: Option<String>,
    /// Recipient keys for the envelope boundary.
    pub recipient_keys: Vec<String>,
    /// Mediator routing keys, outermost last.
    pub routing_keys: Vec<String>,
    /// Sender key for authenticated packing.
    pub sender_key: Option<String>,
    /// Destination endpoint.
    pub endpoint: Option<String>,
}

impl OutboundMessage {
    /// A reply routed back over the connection the inbound arrived on.
    pub fn reply(message: WireMessage, connection_id: Option<String>) -> Self {
        Self {
            message,
            connection_id,
            recipient_keys: Vec::new(),
            routing_keys: Vec::new(),
            sender_key: None,
            endpoint: None,
        }
    }

    /// Set explicit routing details.
    pub fn with_routing(
        mut self,
        recipient_keys: Vec<String>,
        sender_key: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        self.recipient_keys = recipient_keys;
        self.sender_key = sender_key;
        self.endpoint = endpoint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_defaults_to_message_id() {
        let msg = WireMessage::new("https://didcomm.org/trust-ping/1.0/ping", Value::Null);
        assert_eq!(msg.thread_id(), msg.id);

        let threaded = msg.clone().with_thread("thread-1");
        assert_eq!(threaded.thread_id(), "thread-1");
    }

    #[test]
    fn test_reply_shares_thread() {
        let first = WireMessage::new("https://didcomm.org/trust-ping/1.0/ping", Value::Null);
        let reply = WireMessage::reply_to(
            "https://didcomm.org/trust-ping/1.0/ping-response",
            &first,
            Value::Null,
        );
        assert_eq!(reply.thread_id(), first.thread_id());
        assert_ne!(reply.id, first.id);
    }

    #[test]
    fn test_type_uri_parsing() {
        let uri: MessageTypeUri = "https://didcomm.org/connections/1.0/request"
            .parse()
            .unwrap();
        assert_eq!(uri.protocol, "connections");
        assert_eq!(uri.version, "1.0");
        assert_eq!(uri.name, "request");
        assert_eq!(uri.protocol_uri(), "https://didcomm.org/connections/1.0");
        assert_eq!(
            uri.to_string(),
            "https://didcomm.org/connections/1.0/request"
        );
    }

    #[test]
    fn test_type_uri_rejects_garbage() {
        assert!("not-a-uri".parse::<MessageTypeUri>().is_err());
        assert!("https://didcomm.org/onlyprotocol".parse::<MessageTypeUri>().is_err());
        assert!("https://didcomm.org/a/b/c/d".parse::<MessageTypeUri>().is_err());
        assert!("https://example.com/connections/1.0/request"
            .parse::<MessageTypeUri>()
            .is_err());
    }

    #[test]
    fn test_wire_roundtrip_preserves_body() {
        let msg = WireMessage::new(
            "https://didcomm.org/basicmessage/1.0/message",
            serde_json::json!({ "content": "hello", "sent_time": "2024-01-01T00:00:00Z" }),
        )
        .with_thread("t-1");
        let bytes = msg.encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.thread_id(), "t-1");
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn test_decode_rejects_invalid_type() {
        let raw = br#"{"@type": "bogus", "@id": "1"}"#;
        assert!(matches!(
            WireMessage::decode(raw),
            Err(SkeinError::Validation(_))
        ));
    }

    #[test]
    fn test_problem_report_wire_shape() {
        let report = ProblemReport::new("t-9", "unroutable", "no keylist entry");
        let wire = report.to_wire(PROBLEM_REPORT_TYPE);
        assert_eq!(wire.thread_id(), "t-9");
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["description"]["code"], "unroutable");
        assert_eq!(json["description"]["en"], "no keylist entry");
        assert_eq!(json["~thread"]["thid"], "t-9");

        let parsed = ProblemReport::from_wire(&wire).unwrap();
        assert_eq!(parsed, report);
    }
}
