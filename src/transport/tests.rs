use std::sync::Arc;

use serde_json::{Value, json};

use crate::broker::{BrokerOptions, InMemoryBroker};
use crate::client::{BusClient, ClientOptions};
use crate::config::Settings;
use crate::persistence::DeferredLedger;
use crate::transport::handler::{AppState, Session, handle_client_message};
use crate::transport::message::{ClientMessage, ReleaseAction, ServerMessage};

async fn app_state() -> AppState {
    let mut settings = Settings::default();
    settings.bus.receive_wait_ms = 100;
    settings.bus.queue = "jobs".to_string();

    let broker = Arc::new(InMemoryBroker::new(BrokerOptions::from(&settings)));
    let client = BusClient::new(broker, ClientOptions::from(&settings.bus));
    AppState::new(client, settings.bus, DeferredLedger::temporary().unwrap())
        .await
        .unwrap()
}

// Parses `request` the way the server loop does and handles it.
async fn send(state: &AppState, session: &mut Session, request: Value) -> ServerMessage {
    let request: ClientMessage = serde_json::from_value(request).unwrap();
    handle_client_message(state, session, request).await
}

async fn receive_one(state: &AppState, session: &mut Session, receiver: &str) -> (uuid::Uuid, i64) {
    match send(
        state,
        session,
        json!({ "type": "receive", "receiver": receiver, "max_count": 1 }),
    )
    .await
    {
        ServerMessage::Messages { messages, .. } => {
            assert_eq!(messages.len(), 1, "expected one message from {receiver}");
            (
                messages[0].lock_token.unwrap(),
                messages[0].sequence_number,
            )
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

fn error_code(response: &ServerMessage) -> &str {
    match response {
        ServerMessage::Error { code, .. } => code,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[test]
fn test_protocol_messages_are_tagged_by_type() {
    let request: ClientMessage = serde_json::from_str(
        r#"{"type":"release","lock_token":"6f1c1f43-3c1e-4c6a-9a53-0f5c8f2f4f4e","action":"dead_letter","reason":"bad"}"#,
    )
    .unwrap();
    match request {
        ClientMessage::Release {
            action, reason, description, ..
        } => {
            assert_eq!(action, ReleaseAction::DeadLetter);
            assert_eq!(reason.as_deref(), Some("bad"));
            assert!(description.is_none());
        }
        other => panic!("unexpected request: {other:?}"),
    }

    let encoded = serde_json::to_value(ServerMessage::Produced {
        sequence_numbers: vec![1, 2],
    })
    .unwrap();
    assert_eq!(encoded, json!({ "type": "produced", "sequence_numbers": [1, 2] }));

    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
}

#[tokio::test]
async fn test_produce_receive_and_complete() {
    let state = app_state().await;
    let mut session = Session::default();

    let produced = send(
        &state,
        &mut session,
        json!({ "type": "produce_batch", "bodies": ["a", "b"] }),
    )
    .await;
    assert!(matches!(
        produced,
        ServerMessage::Produced { ref sequence_numbers } if sequence_numbers == &vec![1, 2]
    ));

    let (token, seq) = receive_one(&state, &mut session, "primary").await;
    assert_eq!(seq, 1);
    assert_eq!(session.held(), 1);

    let released = send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "complete" }),
    )
    .await;
    assert!(matches!(
        released,
        ServerMessage::Released {
            action: ReleaseAction::Complete,
            ..
        }
    ));
    assert_eq!(session.held(), 0);

    // Releasing the same token again is rejected.
    let again = send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "complete" }),
    )
    .await;
    assert_eq!(error_code(&again), "UNSUPPORTED_OPERATION");

    let peeked = send(
        &state,
        &mut session,
        json!({ "type": "peek", "from_sequence_number": 1 }),
    )
    .await;
    match peeked {
        ServerMessage::Messages { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].body, "b");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_defer_is_recorded_and_received_from_the_ledger() {
    let state = app_state().await;
    let mut session = Session::default();

    send(&state, &mut session, json!({ "type": "produce", "body": "later" })).await;
    let (token, seq) = receive_one(&state, &mut session, "secondary").await;

    send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "defer" }),
    )
    .await;
    assert_eq!(state.ledger.sequence_numbers("jobs").unwrap(), vec![seq]);

    let deferred = send(&state, &mut session, json!({ "type": "receive_deferred" })).await;
    let token = match deferred {
        ServerMessage::Messages { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].sequence_number, seq);
            messages[0].lock_token.unwrap()
        }
        other => panic!("unexpected response: {other:?}"),
    };
    // Receiving is not settling; the number stays until the release.
    assert_eq!(state.ledger.sequence_numbers("jobs").unwrap(), vec![seq]);

    let renewed = send(
        &state,
        &mut session,
        json!({ "type": "renew_lock", "lock_token": token }),
    )
    .await;
    assert!(matches!(renewed, ServerMessage::LockRenewed { .. }));

    let released = send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "complete" }),
    )
    .await;
    assert!(matches!(released, ServerMessage::Released { .. }));
    assert!(state.ledger.sequence_numbers("jobs").unwrap().is_empty());
}

async fn receive_deferred_one(state: &AppState, session: &mut Session) -> uuid::Uuid {
    match send(state, session, json!({ "type": "receive_deferred" })).await {
        ServerMessage::Messages { messages, .. } => {
            assert_eq!(messages.len(), 1, "expected one deferred message");
            messages[0].lock_token.unwrap()
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_abandoned_deferred_message_can_be_received_again() {
    let state = app_state().await;
    let mut session = Session::default();

    send(&state, &mut session, json!({ "type": "produce", "body": "retry me" })).await;
    let (token, seq) = receive_one(&state, &mut session, "primary").await;
    send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "defer" }),
    )
    .await;

    let token = receive_deferred_one(&state, &mut session).await;
    let abandoned = send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "abandon" }),
    )
    .await;
    assert!(matches!(
        abandoned,
        ServerMessage::Released {
            action: ReleaseAction::Abandon,
            ..
        }
    ));
    assert_eq!(state.ledger.sequence_numbers("jobs").unwrap(), vec![seq]);

    // A dropped connection abandons too.
    let mut dropped = Session::default();
    receive_deferred_one(&state, &mut dropped).await;
    dropped.release_all(&state).await;
    assert_eq!(state.ledger.sequence_numbers("jobs").unwrap(), vec![seq]);

    let token = receive_deferred_one(&state, &mut session).await;
    send(
        &state,
        &mut session,
        json!({ "type": "release", "lock_token": token, "action": "dead_letter" }),
    )
    .await;
    assert!(state.ledger.sequence_numbers("jobs").unwrap().is_empty());
    assert!(matches!(
        send(&state, &mut session, json!({ "type": "receive_deferred" })).await,
        ServerMessage::Messages { ref messages, .. } if messages.is_empty()
    ));
}

#[tokio::test]
async fn test_dead_letter_then_receive_from_the_dead_letter_queue() {
    let state = app_state().await;
    let mut session = Session::default();

    send(&state, &mut session, json!({ "type": "produce", "body": "poison" })).await;
    let (token, _) = receive_one(&state, &mut session, "primary").await;
    send(
        &state,
        &mut session,
        json!({
            "type": "release",
            "lock_token": token,
            "action": "dead_letter",
            "reason": "Unparseable",
            "description": "not json"
        }),
    )
    .await;

    let peeked = send(&state, &mut session, json!({ "type": "peek_dead_letter" })).await;
    assert!(matches!(
        peeked,
        ServerMessage::Messages { ref messages, .. } if messages.len() == 1
    ));

    let received = send(&state, &mut session, json!({ "type": "receive_dead_letter" })).await;
    match received {
        ServerMessage::Messages { messages, source } => {
            assert_eq!(source, "dead_letter");
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].dead_letter_reason.as_deref(), Some("Unparseable"));
            assert_eq!(messages[0].dead_letter_description.as_deref(), Some("not json"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_schedule_then_cancel_reports_released_numbers() {
    let state = app_state().await;
    let mut session = Session::default();

    let scheduled = send(
        &state,
        &mut session,
        json!({ "type": "schedule", "bodies": ["x", "y"], "delay_secs": 600 }),
    )
    .await;
    let seqs = match scheduled {
        ServerMessage::Scheduled { sequence_numbers, .. } => sequence_numbers,
        other => panic!("unexpected response: {other:?}"),
    };

    let cancelled = send(
        &state,
        &mut session,
        json!({ "type": "cancel_scheduled", "sequence_numbers": [seqs[0]] }),
    )
    .await;
    assert!(matches!(
        cancelled,
        ServerMessage::Cancelled { ref already_released, .. } if already_released.is_empty()
    ));

    let again = send(
        &state,
        &mut session,
        json!({ "type": "cancel_scheduled", "sequence_numbers": seqs }),
    )
    .await;
    match again {
        ServerMessage::Cancelled {
            sequence_numbers,
            already_released,
        } => {
            assert_eq!(sequence_numbers, vec![seqs[1]]);
            assert_eq!(already_released, vec![seqs[0]]);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_abandons_held_messages() {
    let state = app_state().await;
    let mut first = Session::default();
    let mut second = Session::default();

    send(&state, &mut first, json!({ "type": "produce", "body": "orphan" })).await;
    let (_, seq) = receive_one(&state, &mut first, "secondary").await;

    first.release_all(&state).await;
    assert_eq!(first.held(), 0);

    let (_, redelivered) = receive_one(&state, &mut second, "primary").await;
    assert_eq!(redelivered, seq);
}

#[tokio::test]
async fn test_oversized_produce_is_an_error_response() {
    let state = app_state().await;
    let mut session = Session::default();

    let body = "x".repeat(300 * 1024);
    let response = send(
        &state,
        &mut session,
        json!({ "type": "produce_batch", "bodies": ["small", body] }),
    )
    .await;
    assert_eq!(error_code(&response), "MESSAGE_TOO_LARGE");
}
