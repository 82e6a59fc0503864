//! # inproc-pubsub
//!
//! An in-process publish/subscribe broker that emulates Cloud Pub/Sub
//! semantics — topics, subscriptions, ack/nack, per-key ordering,
//! ack-deadline leases, nack backoff, dead-letter routing — entirely inside
//! a single host process, for local development and testing of event-driven
//! designs.
//!
//! ## Quick Start
//!
//! ### Publish
//!
//! ```no_run
//! use inproc_pubsub::client::{Client, ClientConfig};
//! use inproc_pubsub::topic::TopicConfig;
//! use inproc_pubsub::publisher::PublisherConfig;
//! use inproc_pubsub::message::PublishMessage;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (client, _housekeeper) = Client::new(ClientConfig::default());
//!
//!     client.create_topic("projects/local/topics/test-topic", TopicConfig::default()).unwrap();
//!     let publisher = client.publisher("projects/local/topics/test-topic", PublisherConfig::default());
//!
//!     let awaiter = publisher
//!         .publish_message(PublishMessage {
//!             data: b"abc".to_vec(),
//!             ..Default::default()
//!         })
//!         .await;
//!     let message_id = awaiter.get(None).await.unwrap();
//!     println!("published {message_id}");
//! }
//! ```
//!
//! ### Subscribe
//!
//! ```no_run
//! use inproc_pubsub::client::{Client, ClientConfig};
//! use inproc_pubsub::subscription::SubscriptionConfig;
//! use inproc_pubsub::subscriber::{StreamingPullConfig, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (client, _housekeeper) = Client::new(ClientConfig::default());
//!
//!     let mut config = SubscriptionConfig::new("projects/local/topics/test-topic");
//!     config.enable_message_ordering = true;
//!     client.create_subscription("projects/local/subscriptions/test-subscription", config).unwrap();
//!
//!     let pull = client
//!         .streaming_pull("projects/local/subscriptions/test-subscription", StreamingPullConfig::default())
//!         .unwrap();
//!     pull.start();
//!
//!     let events = pull.events();
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             StreamEvent::Message(message) => {
//!                 println!("{:?}", message.data());
//!                 message.ack().unwrap();
//!             }
//!             StreamEvent::Error(e) => eprintln!("stream error: {e}"),
//!             StreamEvent::Closed => break,
//!         }
//!     }
//!
//!     pull.stop(None).await;
//! }
//! ```
pub mod broker;
pub mod client;
pub mod error;
pub mod housekeeper;
pub mod lease;
pub mod lease_manager;
pub mod message;
pub mod publisher;
pub mod subscriber;
pub mod subscription;
pub mod topic;
