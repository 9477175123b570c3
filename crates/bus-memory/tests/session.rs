use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use proven_bus::{
    Error, LifecycleState, Message, MessageSender, SubscriptionClient, SubscriptionClientOptions,
};
use proven_bus_memory::{Error as MemoryError, MemoryConnection, MemoryConnectionOptions};
use tracing_test::traced_test;

const SHORT: Duration = Duration::from_millis(200);

async fn setup(
    options: MemoryConnectionOptions,
) -> (
    MessageSender<MemoryConnection>,
    SubscriptionClient<MemoryConnection>,
) {
    let connection = MemoryConnection::new(options);
    connection.create_topic("orders").unwrap();
    connection.create_subscription("orders", "fulfilment").unwrap();

    let sender = MessageSender::new(&connection, "orders").await.unwrap();
    let subscription = SubscriptionClient::new(
        connection,
        "orders",
        "fulfilment",
        SubscriptionClientOptions {
            operation_timeout: SHORT,
            ..SubscriptionClientOptions::default()
        },
    )
    .unwrap();

    (sender, subscription)
}

#[tokio::test]
#[traced_test]
async fn test_accept_any_session_receives_its_messages() {
    let (sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    sender
        .send_batch(vec![
            Message::new("a1").with_session_id("customer-a"),
            Message::new("b1").with_session_id("customer-b"),
            Message::new("a2").with_session_id("customer-a"),
        ])
        .await
        .unwrap();

    let session = subscription
        .accept_message_session(None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.session_id(), "customer-a");
    assert_eq!(session.entity_path(), subscription.path());

    let received = session.receive_batch(10).await.unwrap();
    let bodies: Vec<_> = received.iter().map(|m| m.body.clone()).collect();
    assert_eq!(bodies, vec![Bytes::from("a1"), Bytes::from("a2")]);

    let tokens: Vec<_> = received.iter().filter_map(Message::lock_token).collect();
    session.complete_batch(&tokens).await.unwrap();
    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Closed);

    let next = subscription
        .accept_message_session(None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.session_id(), "customer-b");
}

#[tokio::test]
async fn test_no_available_session_returns_none() {
    let (_sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    let accepted = subscription
        .accept_message_session_with_timeout(None, Duration::from_millis(100))
        .await
        .unwrap();

    assert!(accepted.is_none());
}

#[tokio::test]
async fn test_locked_session_cannot_be_accepted_twice() {
    let (sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    sender
        .send(Message::new("x").with_session_id("s1"))
        .await
        .unwrap();

    let _held = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap()
        .unwrap();

    let error = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap_err();
    assert!(error.is_transient());
    assert_matches!(error, Error::Transport(MemoryError::SessionCannotBeLocked(_)));
}

#[tokio::test]
async fn test_invalid_session_id_is_rejected() {
    let (_sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    assert_matches!(
        subscription.accept_message_session(Some("")).await,
        Err(Error::InvalidArgument { .. })
    );
    assert_matches!(
        subscription
            .accept_message_session(Some(&"s".repeat(129)))
            .await,
        Err(Error::InvalidArgument { .. })
    );
}

#[tokio::test]
async fn test_session_state_round_trips() {
    let (_sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    let session = subscription
        .accept_message_session(Some("checkout"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.get_state().await.unwrap(), None);

    session
        .set_state(Some(Bytes::from_static(b"step-2")))
        .await
        .unwrap();
    assert_eq!(
        session.get_state().await.unwrap(),
        Some(Bytes::from_static(b"step-2"))
    );

    session.set_state(None).await.unwrap();
    assert_eq!(session.get_state().await.unwrap(), None);
}

#[tokio::test]
async fn test_renew_session_lock_extends_expiry() {
    let (_sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    let session = subscription
        .accept_message_session(Some("long-running"))
        .await
        .unwrap()
        .unwrap();
    let locked_until = session.locked_until_utc();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let renewed = session.renew_session_lock().await.unwrap();

    assert!(renewed > locked_until);
    assert_eq!(session.locked_until_utc(), renewed);
}

#[tokio::test]
async fn test_expired_session_lock_is_lost() {
    let (_sender, subscription) = setup(MemoryConnectionOptions {
        session_lock_duration: Duration::from_millis(20),
        ..MemoryConnectionOptions::default()
    })
    .await;

    let session = subscription
        .accept_message_session(Some("short"))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_matches!(
        session.renew_session_lock().await,
        Err(Error::LockLost(MemoryError::SessionLockLost(_)))
    );
    assert_matches!(session.get_state().await, Err(Error::LockLost(_)));

    let other = subscription
        .accept_message_session(Some("short"))
        .await
        .unwrap();
    assert!(other.is_some());
}

#[tokio::test]
async fn test_session_defer_and_receive_deferred() {
    let (sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    sender
        .send(Message::new("hold").with_session_id("s1"))
        .await
        .unwrap();

    let session = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap()
        .unwrap();

    let message = session.receive().await.unwrap().unwrap();
    let sequence_number = message.sequence_number().unwrap();
    session
        .defer(message.lock_token().unwrap(), None)
        .await
        .unwrap();

    assert!(
        session
            .receive_batch_with_timeout(1, Duration::from_millis(100))
            .await
            .unwrap()
            .is_empty()
    );

    let deferred = session
        .receive_deferred_batch(&[sequence_number])
        .await
        .unwrap();
    assert_eq!(deferred.len(), 1);

    session
        .dead_letter(deferred[0].lock_token().unwrap(), None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_plain_receive_skips_session_messages() {
    let (sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    sender
        .send_batch(vec![
            Message::new("plain"),
            Message::new("grouped").with_session_id("s1"),
        ])
        .await
        .unwrap();

    let received = subscription
        .receive_batch_with_timeout(10, SHORT)
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, "plain");
}

#[tokio::test]
async fn test_closed_session_rejects_operations() {
    let (_sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    let session = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap()
        .unwrap();
    session.close().await.unwrap();

    assert_matches!(session.receive().await, Err(Error::EntityClosed(_)));
    assert_matches!(session.get_state().await, Err(Error::EntityClosed(_)));

    let reaccepted = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap();
    assert!(reaccepted.is_some());
}

#[tokio::test]
async fn test_session_close_interrupts_pending_receive() {
    let (sender, subscription) = setup(MemoryConnectionOptions::default()).await;

    let session = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap()
        .unwrap();

    let (pending, ()) = tokio::join!(
        session.receive_batch_with_timeout(1, Duration::from_secs(2)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.close().await.unwrap();
            sender
                .send(Message::new("after close").with_session_id("s1"))
                .await
                .unwrap();
        }
    );
    assert_matches!(pending, Err(Error::EntityClosed(_)));

    let next = subscription
        .accept_message_session(Some("s1"))
        .await
        .unwrap()
        .unwrap();
    let received = next.receive_batch(1).await.unwrap();
    assert_eq!(received[0].body, "after close");
}
