use std::time::Duration;

use inproc_pubsub::broker::Broker;
use inproc_pubsub::message::PublishMessage;
use inproc_pubsub::subscriber::{StreamEvent, StreamingPull, StreamingPullConfig};
use inproc_pubsub::subscription::{DeadLetterPolicy, RetryPolicy, SubscriptionConfig};
use inproc_pubsub::topic::TopicConfig;

fn publish(broker: &Broker, topic: &str, data: &[u8], ordering_key: Option<&str>) {
    broker
        .publish(
            topic,
            vec![PublishMessage {
                data: data.to_vec(),
                ordering_key: ordering_key.map(str::to_string),
                ..Default::default()
            }],
        )
        .unwrap();
}

/// spec.md §8 scenario 3: nack redelivers with an incremented
/// `deliveryAttempt` after the retry-policy backoff elapses.
#[tokio::test]
async fn nack_redelivers_with_incremented_attempt() {
    let broker = Broker::new();
    broker.register_topic("t", TopicConfig::default()).unwrap();
    let mut config = SubscriptionConfig::new("t");
    config.retry_policy = RetryPolicy {
        minimum_backoff: Duration::from_millis(30),
        maximum_backoff: Duration::from_millis(30),
    };
    broker.register_subscription("s", config).unwrap();
    publish(&broker, "t", b"x", None);

    let first = broker.pull("s", 1, false).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].delivery_attempt, 1);
    broker.nack(&first[0].ack_id).unwrap();

    // Not yet eligible: still within backoff.
    assert!(broker.pull("s", 1, false).unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = broker.pull("s", 1, false).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].delivery_attempt, 2);
}

/// spec.md §8 scenario 4: a message exceeding `maxDeliveryAttempts` is
/// routed to the DLQ topic, not redelivered on the original subscription.
#[tokio::test]
async fn exhausted_deliveries_route_to_dead_letter_topic() {
    let broker = Broker::new();
    broker.register_topic("t", TopicConfig::default()).unwrap();
    broker.register_topic("td", TopicConfig::default()).unwrap();
    broker.register_subscription("td-sub", SubscriptionConfig::new("td")).unwrap();

    let mut config = SubscriptionConfig::new("t");
    config.retry_policy = RetryPolicy {
        minimum_backoff: Duration::from_millis(1),
        maximum_backoff: Duration::from_millis(1),
    };
    config.dead_letter_policy = Some(DeadLetterPolicy {
        dead_letter_topic: "td".to_string(),
        max_delivery_attempts: 5,
    });
    broker.register_subscription("s", config).unwrap();
    publish(&broker, "t", b"y", None);

    for _ in 0..5 {
        let pulled = broker.pull("s", 1, false).unwrap();
        assert_eq!(pulled.len(), 1, "expected a redelivery");
        broker.nack(&pulled[0].ack_id).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(broker.pull("s", 1, false).unwrap().is_empty(), "message should have been routed to the DLQ");
    let dlq = broker.pull("td-sub", 1, false).unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].data, b"y");
    assert_eq!(dlq[0].delivery_attempt, 6);
    assert_eq!(
        dlq[0].attributes.get("CloudPubSubDeadLetterSourceDeliveryCount").map(String::as_str),
        Some("6")
    );
}

/// spec.md §8 invariant 3 / scenario 5: with ordering enabled, only one
/// lease per (subscription, orderingKey) is outstanding at a time, and
/// messages for a key are delivered strictly in publish order.
#[tokio::test]
async fn ordering_keeps_one_in_flight_lease_per_key() {
    let broker = Broker::new();
    broker.register_topic("t", TopicConfig::default()).unwrap();
    let mut config = SubscriptionConfig::new("t");
    config.enable_message_ordering = true;
    broker.register_subscription("s", config).unwrap();

    publish(&broker, "t", b"A1", Some("A"));
    publish(&broker, "t", b"B1", Some("B"));
    publish(&broker, "t", b"A2", Some("A"));
    publish(&broker, "t", b"B2", Some("B"));

    // A2 must not be leased while A1 is still in flight.
    let batch = broker.pull("s", 10, false).unwrap();
    assert_eq!(batch.len(), 2, "only the head of each ordering key should be leased");
    let a1 = batch.iter().find(|m| m.data == b"A1").expect("A1 delivered");
    assert!(batch.iter().find(|m| m.data == b"A2").is_none());

    broker.ack(&a1.ack_id).unwrap();
    let next = broker.pull("s", 10, false).unwrap();
    let a2 = next.iter().find(|m| m.data == b"A2").expect("A2 delivered only after A1 acked");
    assert_eq!(a2.delivery_attempt, 1);
}

/// `StreamingPull` delivers messages for distinct ordering keys, honoring
/// the per-key gate through the channel-based event loop.
#[tokio::test]
async fn streaming_pull_respects_ordering_gate() {
    let broker = Broker::new();
    broker.register_topic("t", TopicConfig::default()).unwrap();
    let mut config = SubscriptionConfig::new("t");
    config.enable_message_ordering = true;
    broker.register_subscription("s", config.clone()).unwrap();

    let pull = StreamingPull::new(broker.clone(), "s", true, config.ack_deadline, false, StreamingPullConfig::default());
    pull.start();
    let events = pull.events();

    publish(&broker, "t", b"A1", Some("A"));
    publish(&broker, "t", b"A2", Some("A"));

    let first = recv_message(&events).await;
    assert_eq!(first.data(), b"A1");

    // A2 should not arrive until A1 is acked.
    assert!(tokio::time::timeout(Duration::from_millis(100), events.recv()).await.is_err());

    first.ack().unwrap();
    let second = recv_message(&events).await;
    assert_eq!(second.data(), b"A2");
    second.ack().unwrap();

    pull.stop(None).await;
}

async fn recv_message(events: &async_channel::Receiver<StreamEvent>) -> inproc_pubsub::subscriber::ReceivedMessage {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.expect("timed out").unwrap() {
            StreamEvent::Message(m) => return m,
            StreamEvent::Error(_) => continue,
            StreamEvent::Closed => panic!("stream closed before message arrived"),
        }
    }
}
