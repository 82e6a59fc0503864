use inproc_pubsub::client::{Client, ClientConfig};
use inproc_pubsub::message::PublishMessage;
use inproc_pubsub::subscriber::{StreamEvent, StreamingPullConfig};
use inproc_pubsub::subscription::SubscriptionConfig;
use inproc_pubsub::topic::TopicConfig;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt().with_env_filter("inproc_pubsub=debug").try_init();
}

/// End-to-end scenario 1 (spec.md §8): publish one message, pull it,
/// ack it, confirm nothing more is delivered.
#[tokio::test]
async fn basic_round_trip() {
    let (client, _housekeeper) = Client::new(ClientConfig::default());
    client.create_topic("projects/p/topics/t", TopicConfig::default()).unwrap();
    client
        .create_subscription("projects/p/subscriptions/s", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();

    let mut attributes = std::collections::HashMap::new();
    attributes.insert("a".to_string(), "1".to_string());
    client
        .broker()
        .publish(
            "projects/p/topics/t",
            vec![PublishMessage {
                data: b"hi".to_vec(),
                attributes,
                ordering_key: None,
            }],
        )
        .unwrap();

    let messages = client.broker().pull("projects/p/subscriptions/s", 10, false).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"hi");
    assert_eq!(messages[0].attributes.get("a"), Some(&"1".to_string()));
    assert_eq!(messages[0].delivery_attempt, 1);

    client.broker().ack(&messages[0].ack_id).unwrap();
    let again = client.broker().pull("projects/p/subscriptions/s", 10, false).unwrap();
    assert!(again.is_empty());
}

/// End-to-end scenario 2 (spec.md §8): fan-out to two subscriptions.
#[tokio::test]
async fn fan_out_to_independent_subscriptions() {
    let (client, _housekeeper) = Client::new(ClientConfig::default());
    client.create_topic("projects/p/topics/t", TopicConfig::default()).unwrap();
    client
        .create_subscription("projects/p/subscriptions/s1", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();
    client
        .create_subscription("projects/p/subscriptions/s2", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();

    client
        .broker()
        .publish(
            "projects/p/topics/t",
            vec![PublishMessage {
                data: b"m".to_vec(),
                ..Default::default()
            }],
        )
        .unwrap();

    let m1 = client.broker().pull("projects/p/subscriptions/s1", 10, false).unwrap();
    let m2 = client.broker().pull("projects/p/subscriptions/s2", 10, false).unwrap();
    assert_eq!(m1.len(), 1);
    assert_eq!(m2.len(), 1);
    assert_ne!(m1[0].ack_id, m2[0].ack_id);

    client.broker().ack(&m1[0].ack_id).unwrap();
    // s2's copy is untouched by s1's ack.
    assert!(client.broker().pull("projects/p/subscriptions/s2", 10, false).unwrap().is_empty());
    client.broker().ack(&m2[0].ack_id).unwrap();
}

/// spec.md §7: unregistering a topic detaches, but does not delete, its
/// subscriptions; already-queued messages stay deliverable.
#[tokio::test]
async fn topic_deletion_detaches_subscriptions() {
    let (client, _housekeeper) = Client::new(ClientConfig::default());
    client.create_topic("projects/p/topics/t", TopicConfig::default()).unwrap();
    client
        .create_subscription("projects/p/subscriptions/s", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();
    client
        .broker()
        .publish(
            "projects/p/topics/t",
            vec![PublishMessage {
                data: b"x".to_vec(),
                ..Default::default()
            }],
        )
        .unwrap();

    client.delete_topic("projects/p/topics/t").unwrap();
    assert!(client.subscription_exists("projects/p/subscriptions/s"));

    let messages = client.broker().pull("projects/p/subscriptions/s", 10, false).unwrap();
    assert_eq!(messages.len(), 1);
}

/// Unregistering a subscription invalidates outstanding ack-ids with
/// `FailedPrecondition` (spec.md §3, §7).
#[tokio::test]
async fn subscription_deletion_invalidates_leases() {
    use inproc_pubsub::error::Code;

    let (client, _housekeeper) = Client::new(ClientConfig::default());
    client.create_topic("projects/p/topics/t", TopicConfig::default()).unwrap();
    client
        .create_subscription("projects/p/subscriptions/s", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();
    client
        .broker()
        .publish(
            "projects/p/topics/t",
            vec![PublishMessage {
                data: b"x".to_vec(),
                ..Default::default()
            }],
        )
        .unwrap();
    let messages = client.broker().pull("projects/p/subscriptions/s", 10, false).unwrap();

    client.delete_subscription("projects/p/subscriptions/s").unwrap();
    let err = client.broker().ack(&messages[0].ack_id).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

/// Smoke test for the `StreamingPull` facade wiring through `Client`.
#[tokio::test]
async fn streaming_pull_delivers_and_acks() {
    let (client, _housekeeper) = Client::new(ClientConfig::default());
    client.create_topic("projects/p/topics/t", TopicConfig::default()).unwrap();
    client
        .create_subscription("projects/p/subscriptions/s", SubscriptionConfig::new("projects/p/topics/t"))
        .unwrap();

    let pull = client.streaming_pull("projects/p/subscriptions/s", StreamingPullConfig::default()).unwrap();
    pull.start();
    let events = pull.events();

    client
        .broker()
        .publish(
            "projects/p/topics/t",
            vec![PublishMessage {
                data: b"streamed".to_vec(),
                ..Default::default()
            }],
        )
        .unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed");
    match event {
        StreamEvent::Message(message) => {
            assert_eq!(message.data(), b"streamed");
            message.ack().unwrap();
        }
        _ => panic!("expected a message event"),
    }

    pull.stop(None).await;
}
