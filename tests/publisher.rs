use std::collections::HashMap;
use std::time::Duration;

use inproc_pubsub::broker::Broker;
use inproc_pubsub::message::PublishMessage;
use inproc_pubsub::publisher::{Publisher, PublisherConfig};
use inproc_pubsub::subscription::SubscriptionConfig;
use inproc_pubsub::topic::TopicConfig;

fn setup(topic: &str, subscription: &str) -> Broker {
    let broker = Broker::new();
    broker.register_topic(topic, TopicConfig::default()).unwrap();
    broker.register_subscription(subscription, SubscriptionConfig::new(topic)).unwrap();
    broker
}

/// Batches flush on the age trigger even with a single message (spec.md
/// §4.2 batch triggers).
#[tokio::test]
async fn publish_flushes_on_age_trigger() {
    let broker = setup("projects/p/topics/t", "projects/p/subscriptions/s");
    let mut config = PublisherConfig::default();
    config.batching.max_age = Duration::from_millis(20);
    let publisher = Publisher::new(broker.clone(), "projects/p/topics/t", config);

    let awaiter = publisher
        .publish_message(PublishMessage {
            data: b"abc".to_vec(),
            ..Default::default()
        })
        .await;
    let message_id = awaiter.get(None).await.unwrap();
    assert!(!message_id.is_empty());

    let delivered = broker.pull("projects/p/subscriptions/s", 10, false).unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].data, b"abc");
}

/// `flush()` dispatches immediately without waiting for the age trigger.
#[tokio::test]
async fn manual_flush_dispatches_immediately() {
    let broker = setup("projects/p/topics/t", "projects/p/subscriptions/s");
    let mut config = PublisherConfig::default();
    config.batching.max_age = Duration::from_secs(3600);
    let publisher = Publisher::new(broker.clone(), "projects/p/topics/t", config);

    let awaiter = publisher
        .publish_message(PublishMessage {
            data: b"fast".to_vec(),
            ..Default::default()
        })
        .await;
    publisher.flush();
    let message_id = tokio::time::timeout(Duration::from_secs(1), awaiter.get(None)).await.unwrap().unwrap();
    assert!(!message_id.is_empty());
}

/// spec.md §8 invariant 7 / scenario 6: a non-retryable publish failure on
/// an ordering key pauses the key until `resumePublishing` is called.
#[tokio::test]
async fn pause_contract_on_non_retryable_error() {
    let broker = Broker::new();
    // Deliberately never register the topic: publish fails NotFound, which
    // is non-retryable.
    let publisher = Publisher::new(broker.clone(), "projects/p/topics/missing", PublisherConfig::default());

    let first = publisher
        .publish_message(PublishMessage {
            data: b"A1".to_vec(),
            ordering_key: Some("K".to_string()),
            attributes: HashMap::new(),
        })
        .await;
    publisher.flush();
    let err = first.get(None).await.unwrap_err();
    assert_eq!(err.code(), inproc_pubsub::error::Code::NotFound);

    let second = publisher
        .publish_message(PublishMessage {
            data: b"A2".to_vec(),
            ordering_key: Some("K".to_string()),
            attributes: HashMap::new(),
        })
        .await;
    let err = tokio::time::timeout(Duration::from_secs(1), second.get(None)).await.unwrap().unwrap_err();
    assert_eq!(err.code(), inproc_pubsub::error::Code::FailedPrecondition);

    publisher.resume_publishing("K");
    broker.register_topic("projects/p/topics/missing", TopicConfig::default()).unwrap();
    let third = publisher
        .publish_message(PublishMessage {
            data: b"A3".to_vec(),
            ordering_key: Some("K".to_string()),
            attributes: HashMap::new(),
        })
        .await;
    publisher.flush();
    assert!(tokio::time::timeout(Duration::from_secs(1), third.get(None)).await.unwrap().is_ok());
}
