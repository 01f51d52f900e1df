//! End-to-end protocol scenarios driving two peers' services with real
//! wire messages.

use skein_engine::{EventBus, InboundContext, MessageHandler, ThreadLocks};
use skein_protocols::connections::{connection_table, ConnectionKind, TYPE_ACK};
use skein_protocols::mediation::{mediation_table, MediationKind, TYPE_MEDIATE_GRANT};
use skein_protocols::{ConnectionConfig, ConnectionHandler, ConnectionService};
use skein_store::MemoryStore;
use skein_types::event::EventPayload;
use skein_types::records::{
    ConnectionRole, ConnectionState, MediationRecord, MediationRole, MediationState,
};
use skein_types::WireMessage;
use std::sync::Arc;

fn peer(label: &str, did: &str, endpoint: &str) -> (ConnectionService, EventBus) {
    let events = EventBus::default();
    let service = ConnectionService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ThreadLocks::new()),
        events.clone(),
        ConnectionConfig {
            label: label.to_string(),
            did: did.to_string(),
            endpoint: Some(endpoint.to_string()),
            recipient_keys: vec![format!("key-{label}")],
        },
    );
    (service, events)
}

fn drain_state_changes(rx: &mut skein_engine::EventReceiver) -> Vec<String> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EventPayload::StateChanged { new_state, .. } = event.payload {
            states.push(new_state);
        }
    }
    states
}

// A responder walks invitation-sent through completed as the requester's
// request and ack arrive, with one event per committed transition.
#[tokio::test]
async fn test_connection_established_end_to_end() {
    let (bob, bob_events) = peer("bob", "did:peer:bob", "mem://bob");
    let (alice, _) = peer("alice", "did:peer:alice", "mem://alice");
    let mut bob_rx = bob_events.subscribe();

    let (bob_record, invitation) = bob.create_invitation().await.unwrap();
    assert_eq!(bob_record.state, ConnectionState::InvitationSent);

    let (alice_record, request) = alice.receive_invitation(&invitation).await.unwrap();
    assert_eq!(alice_record.state, ConnectionState::RequestSent);
    assert_eq!(
        request.message.parent_thread_id(),
        Some(invitation.id.as_str())
    );

    let response = bob
        .process_request(&request.message)
        .await
        .unwrap()
        .unwrap();
    let ack = alice
        .process_response(&response.message)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.message.message_type, TYPE_ACK);
    bob.process_ack(&ack.message).await.unwrap();

    let thread_id = request.message.thread_id();
    let bob_record = bob.find(thread_id).await.unwrap().unwrap();
    assert_eq!(bob_record.state, ConnectionState::Completed);
    assert_eq!(bob_record.their_did.as_deref(), Some("did:peer:alice"));
    let alice_record = alice.find(thread_id).await.unwrap().unwrap();
    assert_eq!(alice_record.state, ConnectionState::Completed);
    assert_eq!(alice_record.recipient_keys, vec!["key-bob".to_string()]);

    assert_eq!(
        drain_state_changes(&mut bob_rx),
        vec![
            "invitation-sent",
            "request-received",
            "response-sent",
            "completed"
        ]
    );
}

// An ack for a thread nobody has seen is rejected and creates nothing.
#[tokio::test]
async fn test_ack_on_unknown_thread_creates_no_record() {
    let (bob, _) = peer("bob", "did:peer:bob", "mem://bob");
    let ack = WireMessage::new(TYPE_ACK, serde_json::json!({ "status": "OK" }))
        .with_thread("t-never-seen");

    let err = bob.process_ack(&ack).await.unwrap_err();
    assert!(err.is_state_transition());
    assert!(bob.find("t-never-seen").await.unwrap().is_none());
}

// A duplicate ack on a completed connection changes nothing and emits
// no event.
#[tokio::test]
async fn test_duplicate_ack_is_idempotent() {
    let (bob, bob_events) = peer("bob", "did:peer:bob", "mem://bob");
    let (alice, _) = peer("alice", "did:peer:alice", "mem://alice");

    let (_, invitation) = bob.create_invitation().await.unwrap();
    let (_, request) = alice.receive_invitation(&invitation).await.unwrap();
    let response = bob
        .process_request(&request.message)
        .await
        .unwrap()
        .unwrap();
    let ack = alice
        .process_response(&response.message)
        .await
        .unwrap()
        .unwrap();
    bob.process_ack(&ack.message).await.unwrap();

    let mut bob_rx = bob_events.subscribe();
    bob.process_ack(&ack.message).await.unwrap();
    bob.process_ack(&ack.message).await.unwrap();
    assert!(drain_state_changes(&mut bob_rx).is_empty());

    let record = bob.find(ack.message.thread_id()).await.unwrap().unwrap();
    assert_eq!(record.state, ConnectionState::Completed);
}

// The handler surfaces the same strict unknown-thread policy through
// dispatch-facing code.
#[tokio::test]
async fn test_handler_rejects_unknown_thread_ack() {
    let (bob, _) = peer("bob", "did:peer:bob", "mem://bob");
    let handler = ConnectionHandler::new(Arc::new(bob));
    let ack = WireMessage::new(TYPE_ACK, serde_json::json!({ "status": "OK" }))
        .with_thread("t-ghost");

    let err = handler
        .handle(&InboundContext::new(ack))
        .await
        .unwrap_err();
    assert!(err.is_state_transition());
}

// The table fold reaches exactly the state the exchange reaches for the
// same message sequence.
#[test]
fn test_fold_matches_declared_happy_paths() {
    use ConnectionKind as K;

    let table = connection_table();
    assert_eq!(
        table.fold(
            ConnectionState::InvitationSent,
            ConnectionRole::Responder,
            &[K::Request, K::Response, K::Ack]
        ),
        Some(ConnectionState::Completed)
    );
    assert_eq!(
        table.fold(
            ConnectionState::InvitationReceived,
            ConnectionRole::Requester,
            &[K::Request, K::Response, K::Ack]
        ),
        Some(ConnectionState::Completed)
    );
    // Ignored kinds leave the folded state in place.
    assert_eq!(
        table.fold(
            ConnectionState::InvitationSent,
            ConnectionRole::Responder,
            &[K::Request, K::Response, K::Ack, K::Ack, K::Ack]
        ),
        Some(ConnectionState::Completed)
    );
    // A missing edge poisons the whole fold.
    assert_eq!(
        table.fold(
            ConnectionState::InvitationSent,
            ConnectionRole::Responder,
            &[K::Response]
        ),
        None
    );

    let mediation = mediation_table();
    assert_eq!(
        mediation.fold(
            MediationState::Requested,
            MediationRole::Mediator,
            &[MediationKind::Grant, MediationKind::Grant]
        ),
        Some(MediationState::Granted)
    );
    assert_eq!(
        mediation.fold(
            MediationState::Denied,
            MediationRole::Mediator,
            &[MediationKind::Grant]
        ),
        None
    );
}

// Concurrent applies on one thread serialize on the record lock: the
// grant commits exactly once however many deliveries race.
#[tokio::test]
async fn test_concurrent_duplicate_grants_commit_once() {
    use skein_engine::Exchange;

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let exchange: Arc<Exchange<MediationRecord, MediationKind>> = Arc::new(Exchange::new(
        mediation_table(),
        Arc::new(MemoryStore::new()),
        Arc::new(ThreadLocks::new()),
        events,
    ));
    exchange
        .create(MediationRecord::new(
            "t-race",
            "conn-1",
            MediationRole::Mediator,
            MediationState::Requested,
        ))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let exchange = Arc::clone(&exchange);
        tasks.push(tokio::spawn(async move {
            exchange.apply_checked("t-race", MediationKind::Grant).await
        }));
    }
    let mut committed = 0;
    for task in tasks {
        let applied = task.await.unwrap().unwrap();
        assert_eq!(applied.record.state, MediationState::Granted);
        if applied.changed {
            committed += 1;
        }
    }
    assert_eq!(committed, 1);

    let mut granted_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let EventPayload::StateChanged { new_state, .. } = event.payload {
            if new_state == MediationState::Granted.to_string() {
                granted_events += 1;
            }
        }
    }
    assert_eq!(granted_events, 1);
}

// Grant wire messages parse back into the same strongly-typed body.
#[tokio::test]
async fn test_grant_round_trips_through_the_wire() {
    use skein_protocols::mediation::MediateGrant;

    let grant = WireMessage::new(
        TYPE_MEDIATE_GRANT,
        serde_json::to_value(MediateGrant {
            endpoint: "mem://mediator".into(),
            routing_keys: vec!["key-m".into()],
        })
        .unwrap(),
    )
    .with_thread("t-m");
    let decoded = WireMessage::decode(&grant.encode().unwrap()).unwrap();
    let body: MediateGrant = decoded.body_as().unwrap();
    assert_eq!(body.endpoint, "mem://mediator");
    assert_eq!(decoded.thread_id(), "t-m");
}
