//! Two in-process agents talking over channel transports: the full
//! unpack → dispatch → pack cycle on both sides.

use skein_agent::config::IdentityConfig;
use skein_agent::{Agent, AgentConfig};
use skein_engine::{ChannelTransport, EnvelopeBoundary, StubEnvelope};
use skein_types::records::ConnectionState;
use std::sync::Arc;
use tokio::sync::mpsc;

type Frames = mpsc::UnboundedReceiver<(String, Vec<u8>)>;

async fn agent(label: &str) -> (Agent, Frames) {
    let (transport, rx) = ChannelTransport::new();
    let config = AgentConfig {
        identity: IdentityConfig {
            label: label.to_string(),
            did: format!("did:peer:{label}"),
            endpoint: Some(format!("mem://{label}")),
            recipient_keys: vec![format!("key-{label}")],
        },
        ..AgentConfig::default()
    };
    let agent = Agent::start(config, Arc::new(StubEnvelope::new()), Arc::new(transport))
        .await
        .unwrap();
    (agent, rx)
}

/// Take the next frame off a transport and hand it to the peer.
async fn pump(rx: &mut Frames, to: &Agent, expected_endpoint: &str) {
    let (endpoint, frame) = rx.recv().await.unwrap();
    assert_eq!(endpoint, expected_endpoint);
    to.receive(&frame).await.unwrap();
}

#[tokio::test]
async fn test_connection_and_chat_over_the_wire() {
    let (alice, mut alice_rx) = agent("alice").await;
    let (bob, mut bob_rx) = agent("bob").await;

    // Invitation travels out of band; the rest is packed wire traffic.
    let (_, invitation) = bob.connections().create_invitation().await.unwrap();
    let (alice_record, request) = alice
        .connections()
        .receive_invitation(&invitation)
        .await
        .unwrap();
    let thread_id = alice_record.thread_id.clone();
    alice.send(request).await.unwrap();

    pump(&mut alice_rx, &bob, "mem://bob").await; // request
    pump(&mut bob_rx, &alice, "mem://alice").await; // response
    pump(&mut alice_rx, &bob, "mem://bob").await; // ack

    let alice_conn = alice.connections().find(&thread_id).await.unwrap().unwrap();
    assert_eq!(alice_conn.state, ConnectionState::Completed);
    assert_eq!(alice_conn.their_did.as_deref(), Some("did:peer:bob"));
    let bob_conn = bob.connections().find(&thread_id).await.unwrap().unwrap();
    assert_eq!(bob_conn.state, ConnectionState::Completed);
    assert_eq!(bob_conn.recipient_keys, vec!["key-alice".to_string()]);

    // Chat over the established connection.
    let chat = alice
        .basic_messages()
        .send(&alice_conn.id, "hello bob")
        .await
        .unwrap();
    alice.send(chat).await.unwrap();
    pump(&mut alice_rx, &bob, "mem://bob").await;

    let history = bob.basic_messages().history(&bob_conn.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hello bob");
}

#[tokio::test]
async fn test_discover_features_over_the_wire() {
    let (alice, mut alice_rx) = agent("alice").await;
    let (bob, mut bob_rx) = agent("bob").await;

    let (_, invitation) = bob.connections().create_invitation().await.unwrap();
    let (_, request) = alice
        .connections()
        .receive_invitation(&invitation)
        .await
        .unwrap();
    alice.send(request).await.unwrap();
    pump(&mut alice_rx, &bob, "mem://bob").await;
    pump(&mut bob_rx, &alice, "mem://alice").await;
    pump(&mut alice_rx, &bob, "mem://bob").await;

    // Alice asks bob what he speaks.
    let query = skein_types::WireMessage::new(
        "https://didcomm.org/discover-features/1.0/query",
        serde_json::json!({ "query": "https://didcomm.org/*" }),
    );
    let raw = StubEnvelope::new()
        .pack(&query, &["key-bob".to_string()], Some("key-alice"))
        .await
        .unwrap();
    bob.receive(&raw).await.unwrap();

    let (endpoint, frame) = bob_rx.recv().await.unwrap();
    assert_eq!(endpoint, "mem://alice");
    let disclose = StubEnvelope::new().unpack(&frame).await.unwrap();
    assert_eq!(
        disclose.message.message_type,
        "https://didcomm.org/discover-features/1.0/disclose"
    );
    let body: serde_json::Value = disclose.message.body_as().unwrap();
    let pids: Vec<&str> = body["protocols"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["pid"].as_str().unwrap())
        .collect();
    assert!(pids.contains(&"https://didcomm.org/connections/1.0"));
    assert!(pids.contains(&"https://didcomm.org/basicmessage/1.0"));
}
