//! Consumer configuration options recognised by the partition consumer.
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::id::MessageID;

/// Errors loading [`ConsumerConfig`] from a file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("configuration file not found at '{0}'")]
    PathNotFound(String),

    #[error("unable to read configuration file at '{0}'")]
    Open(String),

    #[error("unable to decode configuration from file at '{0}'")]
    Decode(String),
}

/// How a subscription consumes messages across the consumers sharing it.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SubscriptionType {
    Exclusive,
    Shared,
    Failover,
    KeyShared,
}

/// Whether the broker persists the subscription cursor across client disconnects.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Durable,
    NonDurable,
}

/// Where a non-durable subscription starts reading from when it has no prior cursor.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum InitialPosition {
    Latest,
    Earliest,
}

/// Policy applied when a message cannot be decrypted.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum CryptoFailureAction {
    /// Deliver the undecrypted payload to the application with an undecryptable marker.
    Consume,
    /// Ack the message with a decryption-error validation reason and drop it.
    Discard,
    /// Drop the message with no ack; it will be redelivered.
    FailConsume,
}

/// A requested start position for a non-durable subscription.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StartMessageId {
    pub id: MessageID,
    pub inclusive: bool,
}

/// Backoff configuration shared by broker reconnection.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay, in milliseconds, before the first retry.
    #[serde(default = "BackoffConfig::default_start_delay_ms")]
    pub start_delay_ms: u64,

    /// Maximum delay, in seconds, between retries.
    #[serde(default = "BackoffConfig::default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Maximum number of reconnect attempts. Absent means unlimited (`maxReconnectToBroker`
    /// unset), `Some(0)` means never retry, `Some(n)` stops after `n` attempts.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "BackoffConfig::default_multiplier")]
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            start_delay_ms: Self::default_start_delay_ms(),
            max_delay_secs: Self::default_max_delay_secs(),
            max_retries: None,
            multiplier: Self::default_multiplier(),
        }
    }
}

impl BackoffConfig {
    fn default_start_delay_ms() -> u64 {
        200
    }
    fn default_max_delay_secs() -> u64 {
        30
    }
    fn default_multiplier() -> u32 {
        2
    }
}

/// Configuration for a single partition consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Topic name.
    pub topic: String,

    /// Subscription name.
    pub subscription: String,

    /// Subscription type.
    #[serde(default = "ConsumerConfig::default_subscription_type")]
    pub subscription_type: SubscriptionType,

    /// Where to start consuming if no cursor is persisted.
    #[serde(default = "ConsumerConfig::default_initial_position")]
    pub initial_position: InitialPosition,

    /// The partition index this consumer is responsible for.
    pub partition_index: i32,

    /// Size of the bounded prefetch queue, in messages. Must be greater than zero.
    #[serde(default = "ConsumerConfig::default_receiver_queue_size")]
    pub receiver_queue_size: usize,

    /// Delay before a nacked message is considered for redelivery.
    #[serde(default = "ConsumerConfig::default_nack_redelivery_delay")]
    pub nack_redelivery_delay: Duration,

    /// Free-form metadata attached to the `Subscribe` RPC.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Forward the replicated-subscription-state flag to the broker.
    #[serde(default)]
    pub replicate_subscription_state: bool,

    /// Requested start message id, honoured only for non-durable subscriptions.
    #[serde(default)]
    pub start_message_id: Option<StartMessageId>,

    /// Durable vs non-durable cursor.
    #[serde(default = "ConsumerConfig::default_subscription_mode")]
    pub subscription_mode: SubscriptionMode,

    /// Whether the broker should serve compacted topic data.
    #[serde(default)]
    pub read_compacted: bool,

    /// Disable the default `ForceTopicCreation=true` override on the wire.
    #[serde(default)]
    pub disable_force_topic_creation: bool,

    /// Broker reconnect backoff configuration.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Policy for undecryptable messages.
    #[serde(default = "ConsumerConfig::default_crypto_failure_action")]
    pub crypto_failure_action: CryptoFailureAction,
}

impl ConsumerConfig {
    fn default_subscription_type() -> SubscriptionType {
        SubscriptionType::Exclusive
    }

    fn default_initial_position() -> InitialPosition {
        InitialPosition::Latest
    }

    fn default_receiver_queue_size() -> usize {
        1000
    }

    fn default_nack_redelivery_delay() -> Duration {
        Duration::from_secs(60)
    }

    fn default_subscription_mode() -> SubscriptionMode {
        SubscriptionMode::Durable
    }

    fn default_crypto_failure_action() -> CryptoFailureAction {
        CryptoFailureAction::FailConsume
    }

    /// The flow-control threshold: half the queue size, but never less than one.
    pub fn flow_threshold(&self) -> usize {
        std::cmp::max(self.receiver_queue_size / 2, 1)
    }

    /// Load a [`ConsumerConfig`] from a YAML file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConsumerConfig> {
        let path = path.as_ref();
        if !path.exists() {
            let error = LoadError::PathNotFound(path.display().to_string());
            return Err(anyhow::anyhow!(error));
        }
        let file = File::open(path)
            .with_context(|| LoadError::Open(path.display().to_string()))?;
        let conf = serde_yaml::from_reader(file)
            .with_context(|| LoadError::Decode(path.display().to_string()))?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_threshold_never_below_one() {
        let mut conf = sample();
        conf.receiver_queue_size = 1;
        assert_eq!(conf.flow_threshold(), 1);
    }

    #[test]
    fn flow_threshold_is_half_queue_size() {
        let mut conf = sample();
        conf.receiver_queue_size = 10;
        assert_eq!(conf.flow_threshold(), 5);
    }

    fn sample() -> ConsumerConfig {
        ConsumerConfig {
            topic: "persistent://public/default/test".into(),
            subscription: "test-sub".into(),
            subscription_type: SubscriptionType::Exclusive,
            initial_position: InitialPosition::Latest,
            partition_index: 0,
            receiver_queue_size: 1000,
            nack_redelivery_delay: Duration::from_secs(60),
            metadata: HashMap::new(),
            replicate_subscription_state: false,
            start_message_id: None,
            subscription_mode: SubscriptionMode::Durable,
            read_compacted: false,
            disable_force_topic_creation: false,
            backoff: BackoffConfig::default(),
            crypto_failure_action: CryptoFailureAction::FailConsume,
        }
    }
}
