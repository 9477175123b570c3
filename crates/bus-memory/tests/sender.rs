use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeDelta, Utc};
use proven_bus::{Error, Message, MessageSender, SubscriptionClient, SubscriptionClientOptions};
use proven_bus_memory::MemoryConnection;
use tracing_test::traced_test;

const SHORT: Duration = Duration::from_millis(200);

async fn setup() -> (
    MemoryConnection,
    MessageSender<MemoryConnection>,
    SubscriptionClient<MemoryConnection>,
) {
    let connection = MemoryConnection::default();
    connection.create_topic("events").unwrap();
    connection.create_subscription("events", "all").unwrap();

    let sender = MessageSender::new(&connection, "events").await.unwrap();
    let subscription = SubscriptionClient::new(
        connection.clone(),
        "events",
        "all",
        SubscriptionClientOptions::default(),
    )
    .unwrap();

    (connection, sender, subscription)
}

#[tokio::test]
#[traced_test]
async fn test_resending_a_received_message_is_rejected() {
    let (_connection, sender, subscription) = setup().await;

    sender.send(Message::new("original")).await.unwrap();

    let received = subscription
        .receive_batch_with_timeout(1, SHORT)
        .await
        .unwrap();
    assert_eq!(received.len(), 1);

    let locked = received.into_iter().next().unwrap();
    assert_matches!(
        sender.send(locked.clone()).await,
        Err(Error::InvalidOperation(_))
    );
    assert_matches!(
        sender.send_batch(vec![Message::new("fresh"), locked]).await,
        Err(Error::InvalidOperation(_))
    );

    let peeked = subscription.peek_by_sequence_number(1, 10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].body, "original");
}

#[tokio::test]
async fn test_batch_send_returns_count() {
    let (_connection, sender, subscription) = setup().await;

    let sent = sender
        .send_batch(vec![Message::new("a"), Message::new("b"), Message::new("c")])
        .await
        .unwrap();
    assert_eq!(sent, 3);

    assert_matches!(
        sender.send_batch(Vec::new()).await,
        Err(Error::InvalidArgument { argument: "messages", .. })
    );

    assert_eq!(subscription.peek_batch(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_oversized_message_id_sends_nothing() {
    let (_connection, sender, subscription) = setup().await;

    let batch = vec![
        Message::new("ok"),
        Message::new("too long").with_message_id("x".repeat(129)),
    ];
    assert_matches!(
        sender.send_batch(batch).await,
        Err(Error::InvalidArgument { .. })
    );

    assert!(subscription.peek_batch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_in_the_past_is_rejected() {
    let (_connection, sender, _subscription) = setup().await;

    let past = Utc::now() - TimeDelta::seconds(1);
    assert_matches!(
        sender.schedule_message(Message::new("late"), past).await,
        Err(Error::InvalidArgument { .. })
    );
}

#[tokio::test]
#[traced_test]
async fn test_scheduled_message_arrives_when_due() {
    let (_connection, sender, subscription) = setup().await;

    let at = Utc::now() + TimeDelta::milliseconds(150);
    let sequence_number = sender
        .schedule_message(Message::new("soon"), at)
        .await
        .unwrap();
    assert!(sequence_number > 0);

    assert!(subscription.peek_batch(10).await.unwrap().is_empty());

    let received = subscription
        .receive_batch_with_timeout(1, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].scheduled_enqueue_time_utc, Some(at));
}

#[tokio::test]
async fn test_cancelled_scheduled_message_never_arrives() {
    let (_connection, sender, subscription) = setup().await;

    let at = Utc::now() + TimeDelta::milliseconds(100);
    let sequence_number = sender
        .schedule_message(Message::new("never"), at)
        .await
        .unwrap();
    sender.cancel_scheduled_message(sequence_number).await.unwrap();

    let received = subscription
        .receive_batch_with_timeout(1, Duration::from_millis(300))
        .await
        .unwrap();
    assert!(received.is_empty());

    assert_matches!(
        sender.cancel_scheduled_message(sequence_number).await,
        Err(Error::Transport(_))
    );
}

#[tokio::test]
async fn test_closed_sender_rejects_operations() {
    let (_connection, sender, _subscription) = setup().await;

    sender.close().await.unwrap();
    sender.close().await.unwrap();

    assert_matches!(
        sender.send(Message::new("late")).await,
        Err(Error::EntityClosed(path)) if path == "events"
    );
    assert_matches!(
        sender.cancel_scheduled_message(1).await,
        Err(Error::EntityClosed(_))
    );
}

#[tokio::test]
async fn test_sender_for_missing_entity_fails() {
    let connection = MemoryConnection::default();

    assert_matches!(
        MessageSender::new(&connection, "missing").await,
        Err(Error::Transport(_))
    );
    assert_matches!(
        MessageSender::new(&connection, "").await,
        Err(Error::InvalidArgument { .. })
    );
}

#[tokio::test]
async fn test_sender_from_connection_string_shares_namespace() {
    let connection_string =
        "Endpoint=sb://sender-test.example/;SharedAccessKeyName=root;SharedAccessKey=secret";

    let admin = MemoryConnection::shared("sb://sender-test.example/", Default::default());
    admin.create_queue("orders").unwrap();

    let sender = MessageSender::<MemoryConnection>::from_connection_string(
        connection_string,
        Some("orders"),
    )
    .await
    .unwrap();
    sender.send(Message::new("hello")).await.unwrap();

    assert_matches!(
        MessageSender::<MemoryConnection>::from_connection_string(connection_string, None).await,
        Err(Error::InvalidArgument { argument: "entity_path", .. })
    );
}
