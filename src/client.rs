//! Thin facade composing Broker + Publisher + StreamingPull (spec.md §1:
//! "the public client facade... are thin adapters"; out of core scope but
//! kept as the practical entry point for tests and embedding applications).
//! Grounded on the teacher's `Client`/`ClientConfig`, minus the connection
//! pool and gRPC channels it no longer needs.

use crate::broker::Broker;
use crate::error::Error;
use crate::housekeeper::{Housekeeper, HousekeeperConfig};
use crate::publisher::{Publisher, PublisherConfig};
use crate::subscriber::StreamingPullConfig;
use crate::subscription::SubscriptionConfig;
use crate::subscriber::StreamingPull;
use crate::topic::TopicConfig;

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub housekeeper: HousekeeperConfig,
}

/// Scoped to a single in-process broker instance. Clients should be reused
/// rather than created per-call; a `Client` may be shared by multiple tasks.
#[derive(Clone)]
pub struct Client {
    broker: Broker,
}

impl Client {
    /// Creates a client with its own broker and starts the housekeeper.
    /// Mirrors the teacher's `Client::new`, minus the emulator-host /
    /// connection-pool bootstrap it no longer needs.
    pub fn new(config: ClientConfig) -> (Self, Housekeeper) {
        let broker = Broker::new();
        let housekeeper = Housekeeper::spawn(broker.clone(), config.housekeeper);
        (Self { broker }, housekeeper)
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn create_topic(&self, name: &str, config: TopicConfig) -> Result<(), Error> {
        self.broker.register_topic(name, config)
    }

    pub fn delete_topic(&self, name: &str) -> Result<(), Error> {
        self.broker.unregister_topic(name)
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.broker.topic_exists(name)
    }

    pub fn topics(&self) -> Vec<String> {
        self.broker.topic_names()
    }

    pub fn create_subscription(&self, name: &str, config: SubscriptionConfig) -> Result<(), Error> {
        self.broker.register_subscription(name, config)
    }

    pub fn delete_subscription(&self, name: &str) -> Result<(), Error> {
        self.broker.unregister_subscription(name)
    }

    pub fn subscription_exists(&self, name: &str) -> bool {
        self.broker.subscription_exists(name)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.broker.subscription_names()
    }

    pub fn publisher(&self, topic: &str, config: PublisherConfig) -> Publisher {
        Publisher::new(self.broker.clone(), topic, config)
    }

    /// Builds a `StreamingPull` against `subscription`, reading its ack
    /// deadline and ordering flag from the registered `SubscriptionConfig`.
    pub fn streaming_pull(&self, subscription: &str, config: StreamingPullConfig) -> Result<StreamingPull, Error> {
        let sub_config = self.broker.subscription_config(subscription)?;
        Ok(StreamingPull::new(
            self.broker.clone(),
            subscription,
            sub_config.enable_message_ordering,
            sub_config.ack_deadline,
            sub_config.exactly_once_delivery,
            config,
        ))
    }
}
