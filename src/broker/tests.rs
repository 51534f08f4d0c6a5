use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::broker::queue::MAX_DELIVERY_COUNT_EXCEEDED;
use crate::broker::{
    BrokerOptions, BrokerTransport, Handle, HandleKind, InMemoryBroker, MessageState,
    OutboundMessage, QueueAddress, ReceiveMode, SettleAction, SubQueue,
};
use crate::utils::{BusError, LockLostReason};

const NO_WAIT: Duration = Duration::ZERO;

fn broker_with(lock_duration: Duration, max_delivery_count: u32) -> InMemoryBroker {
    InMemoryBroker::new(BrokerOptions {
        lock_duration,
        max_delivery_count,
        poll_interval: Duration::from_millis(10),
    })
}

async fn peek_lock(broker: &InMemoryBroker, address: QueueAddress) -> Handle {
    broker
        .open(&address, HandleKind::Receiver(ReceiveMode::PeekLock))
        .await
        .unwrap()
}

async fn send(broker: &InMemoryBroker, queue: &str, bodies: &[&str]) -> Vec<i64> {
    let sender = broker
        .open(&QueueAddress::main(queue), HandleKind::Sender)
        .await
        .unwrap();
    let encoded = bodies
        .iter()
        .map(|body| OutboundMessage::new(*body).to_bytes().unwrap())
        .collect();
    broker.send_batch(&sender, encoded).await.unwrap()
}

#[test]
fn test_address_display_and_parse() {
    assert_eq!(QueueAddress::main("orders").to_string(), "orders");
    assert_eq!(
        QueueAddress::deferred("orders").to_string(),
        "orders/$deferred"
    );
    assert_eq!(
        QueueAddress::dead_letter("orders").to_string(),
        "orders/$deadletterqueue"
    );

    let parsed = QueueAddress::from_str("orders/$DeadLetterQueue").unwrap();
    assert_eq!(parsed, QueueAddress::dead_letter("orders"));
    assert_eq!(
        QueueAddress::from_str("orders").unwrap().sub_queue,
        SubQueue::Main
    );

    assert!(matches!(
        QueueAddress::from_str("orders/$archive"),
        Err(BusError::InvalidAddress(_))
    ));
    assert!(matches!(
        QueueAddress::from_str("/$deferred"),
        Err(BusError::InvalidAddress(_))
    ));
}

#[tokio::test]
async fn test_sequence_numbers_are_per_queue_and_increasing() {
    let broker = InMemoryBroker::default();

    assert_eq!(send(&broker, "a", &["1", "2"]).await, vec![1, 2]);
    assert_eq!(send(&broker, "b", &["1"]).await, vec![1]);
    assert_eq!(send(&broker, "a", &["3"]).await, vec![3]);
    assert_eq!(broker.depth(&QueueAddress::main("a")), 3);
}

#[tokio::test]
async fn test_locked_message_is_hidden_until_lock_expires() {
    let broker = broker_with(Duration::from_millis(100), 0);
    send(&broker, "q", &["hello"]).await;
    let first = peek_lock(&broker, QueueAddress::main("q")).await;
    let second = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&first, 10, NO_WAIT).await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].lock_token.is_some());
    assert_eq!(delivered[0].delivery_count, 1);

    assert!(broker.fetch(&second, 10, NO_WAIT).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let redelivered = broker.fetch(&second, 10, NO_WAIT).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].sequence_number, delivered[0].sequence_number);
    assert_eq!(redelivered[0].delivery_count, 2);
    assert_ne!(redelivered[0].lock_token, delivered[0].lock_token);

    // The first holder's lock is gone.
    let err = broker
        .settle(&first, delivered[0].lock_token.unwrap(), SettleAction::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::LockLost { .. }));
}

#[tokio::test]
async fn test_abandon_makes_message_visible_to_another_handle() {
    let broker = InMemoryBroker::default();
    send(&broker, "q", &["work"]).await;
    let first = peek_lock(&broker, QueueAddress::main("q")).await;
    let second = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&first, 1, NO_WAIT).await.unwrap();
    broker
        .settle(&first, delivered[0].lock_token.unwrap(), SettleAction::Abandon)
        .await
        .unwrap();

    let redelivered = broker.fetch(&second, 1, NO_WAIT).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].body, "work");
}

#[tokio::test]
async fn test_settlement_requires_the_holding_handle() {
    let broker = InMemoryBroker::default();
    send(&broker, "q", &["work"]).await;
    let owner = peek_lock(&broker, QueueAddress::main("q")).await;
    let other = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&owner, 1, NO_WAIT).await.unwrap();
    let token = delivered[0].lock_token.unwrap();

    let err = broker
        .settle(&other, token, SettleAction::Complete)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::LockLost {
            reason: LockLostReason::NotHeld,
            ..
        }
    ));

    broker
        .settle(&owner, token, SettleAction::Complete)
        .await
        .unwrap();
    assert_eq!(broker.depth(&QueueAddress::main("q")), 0);

    let err = broker
        .settle(&owner, token, SettleAction::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::LockLost { .. }));
    assert!(matches!(
        broker.renew_lock(&owner, token).await,
        Err(BusError::LockLost { .. })
    ));
}

#[tokio::test]
async fn test_renew_extends_the_lock() {
    let broker = broker_with(Duration::from_millis(200), 0);
    send(&broker, "q", &["work"]).await;
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&handle, 1, NO_WAIT).await.unwrap();
    let token = delivered[0].lock_token.unwrap();
    let first_until = delivered[0].locked_until.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let renewed_until = broker.renew_lock(&handle, token).await.unwrap();
    assert!(renewed_until > first_until);

    // Past the original expiry, still held.
    tokio::time::sleep(Duration::from_millis(120)).await;
    broker
        .settle(&handle, token, SettleAction::Complete)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_deferred_message_only_comes_back_by_sequence_number() {
    let broker = InMemoryBroker::default();
    let seqs = send(&broker, "q", &["later", "now"]).await;
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&handle, 1, NO_WAIT).await.unwrap();
    assert_eq!(delivered[0].sequence_number, seqs[0]);
    broker
        .settle(&handle, delivered[0].lock_token.unwrap(), SettleAction::Defer)
        .await
        .unwrap();

    let next = broker.fetch(&handle, 10, NO_WAIT).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].sequence_number, seqs[1]);

    let deferred_view = peek_lock(&broker, QueueAddress::deferred("q")).await;
    let peeked = broker.peek(&deferred_view, 10, 1).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].state, MessageState::Deferred);
    assert!(matches!(
        broker.fetch(&deferred_view, 1, NO_WAIT).await,
        Err(BusError::UnsupportedOperation(_))
    ));

    // Unknown numbers are skipped.
    let fetched = broker
        .fetch_deferred(&handle, &[seqs[0], 999])
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].body, "later");
    assert_eq!(fetched[0].state, MessageState::Deferred);

    broker
        .settle(&handle, fetched[0].lock_token.unwrap(), SettleAction::Complete)
        .await
        .unwrap();
    assert!(broker.fetch_deferred(&handle, &[seqs[0]]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_letter_keeps_reason_and_description() {
    let broker = InMemoryBroker::default();
    send(&broker, "q", &["poison"]).await;
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    let delivered = broker.fetch(&handle, 1, NO_WAIT).await.unwrap();
    broker
        .settle(
            &handle,
            delivered[0].lock_token.unwrap(),
            SettleAction::DeadLetter {
                reason: Some("BadFormat".into()),
                description: Some("body is not json".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(broker.depth(&QueueAddress::main("q")), 0);
    assert_eq!(broker.depth(&QueueAddress::dead_letter("q")), 1);

    let dlq = peek_lock(&broker, QueueAddress::dead_letter("q")).await;
    let dead = broker.fetch(&dlq, 10, NO_WAIT).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("BadFormat"));
    assert_eq!(
        dead[0].dead_letter_description.as_deref(),
        Some("body is not json")
    );

    let err = broker
        .settle(
            &dlq,
            dead[0].lock_token.unwrap(),
            SettleAction::DeadLetter {
                reason: None,
                description: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::UnsupportedOperation(_)));
}

#[tokio::test]
async fn test_exhausted_deliveries_are_dead_lettered() {
    let broker = broker_with(Duration::from_secs(60), 2);
    send(&broker, "q", &["flaky"]).await;
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    for _ in 0..2 {
        let delivered = broker.fetch(&handle, 1, NO_WAIT).await.unwrap();
        assert_eq!(delivered.len(), 1);
        broker
            .settle(&handle, delivered[0].lock_token.unwrap(), SettleAction::Abandon)
            .await
            .unwrap();
    }

    assert!(broker.fetch(&handle, 1, NO_WAIT).await.unwrap().is_empty());
    let dlq = peek_lock(&broker, QueueAddress::dead_letter("q")).await;
    let dead = broker.peek(&dlq, 10, 1).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].dead_letter_reason.as_deref(),
        Some(MAX_DELIVERY_COUNT_EXCEEDED)
    );
    assert_eq!(dead[0].delivery_count, 2);
}

#[tokio::test]
async fn test_receive_and_delete_never_redelivers() {
    let broker = broker_with(Duration::from_millis(50), 0);
    send(&broker, "q", &["a", "b", "c"]).await;
    let handle = broker
        .open(
            &QueueAddress::main("q"),
            HandleKind::Receiver(ReceiveMode::ReceiveAndDelete),
        )
        .await
        .unwrap();

    let first = broker.fetch(&handle, 2, NO_WAIT).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|m| m.lock_token.is_none()));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let rest = broker.fetch(&handle, 10, NO_WAIT).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].body, "c");
    assert_eq!(broker.depth(&QueueAddress::main("q")), 0);

    assert!(matches!(
        broker.renew_lock(&handle, uuid::Uuid::new_v4()).await,
        Err(BusError::UnsupportedOperation(_))
    ));
}

#[tokio::test]
async fn test_scheduled_messages_release_and_cancel() {
    let broker = InMemoryBroker::default();
    let sender = broker
        .open(&QueueAddress::main("q"), HandleKind::Sender)
        .await
        .unwrap();
    let receiver = peek_lock(&broker, QueueAddress::main("q")).await;

    let release_at = Utc::now() + TimeDelta::milliseconds(150);
    let encoded = ["keep", "drop"]
        .iter()
        .map(|body| OutboundMessage::new(*body).to_bytes().unwrap())
        .collect();
    let seqs = broker
        .schedule_batch(&sender, encoded, release_at)
        .await
        .unwrap();
    assert_eq!(seqs.len(), 2);

    let peeked = broker.peek(&receiver, 10, 1).await.unwrap();
    assert!(peeked.iter().all(|m| m.state == MessageState::Scheduled));
    assert!(broker.fetch(&receiver, 10, NO_WAIT).await.unwrap().is_empty());

    broker.cancel_scheduled(&sender, &[seqs[1]]).await.unwrap();

    let released = broker
        .fetch(&receiver, 10, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].body, "keep");
    assert_eq!(released[0].scheduled_enqueue_time, Some(release_at));

    let err = broker
        .cancel_scheduled(&sender, &seqs)
        .await
        .unwrap_err();
    match err {
        BusError::AlreadyReleased { sequence_numbers } => assert_eq!(sequence_numbers, seqs),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_peek_does_not_lock_or_count_deliveries() {
    let broker = InMemoryBroker::default();
    send(&broker, "q", &["a", "b", "c"]).await;
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    let peeked = broker.peek(&handle, 2, 2).await.unwrap();
    assert_eq!(
        peeked.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert!(peeked.iter().all(|m| m.lock_token.is_none() && m.delivery_count == 0));

    let delivered = broker.fetch(&handle, 10, NO_WAIT).await.unwrap();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|m| m.delivery_count == 1));
}

#[tokio::test]
async fn test_waiting_fetch_wakes_on_send() {
    let broker = Arc::new(InMemoryBroker::default());
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;

    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.fetch(&handle, 1, Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&broker, "q", &["late"]).await;

    let delivered = waiter.await.unwrap().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "late");
}

#[tokio::test]
async fn test_closed_handle_is_rejected() {
    let broker = InMemoryBroker::default();
    let handle = peek_lock(&broker, QueueAddress::main("q")).await;
    assert_eq!(broker.open_handles(), 1);

    broker.close(&handle).await.unwrap();
    broker.close(&handle).await.unwrap();
    assert_eq!(broker.open_handles(), 0);

    assert!(matches!(
        broker.fetch(&handle, 1, NO_WAIT).await,
        Err(BusError::Closed(_))
    ));
}

#[tokio::test]
async fn test_sender_cannot_target_a_sub_queue() {
    let broker = InMemoryBroker::default();
    let err = broker
        .open(&QueueAddress::dead_letter("q"), HandleKind::Sender)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::UnsupportedOperation(_)));
}
