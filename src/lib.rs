//! A per-topic-partition broker subscription client.
//!
//! Maintains a long-lived subscription to a broker, pulls messages through a
//! permit-based flow-control protocol, decrypts/decompresses/deframes them, delivers
//! them in arrival order to an application channel, and handles acknowledgement,
//! negative-acknowledgement, seek, unsubscribe, and transparent reconnection across
//! broker-session loss.
//!
//! The implementation is split into the five components documented on
//! [`crate::consumer::PartitionConsumer`]: a connection manager, an event loop, a
//! receive pipeline, a dispatcher, and the message identity model in [`id`].
pub mod backoff;
pub mod collaborators;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
#[cfg(any(test, feature = "test-fixture"))]
pub mod fixture;
pub mod id;
pub mod logging;
pub mod message;
pub mod receive;
pub mod shared;
pub mod state;
pub mod telemetry;
pub mod wire;

pub use config::ConsumerConfig;
pub use consumer::Collaborators;
pub use consumer::PartitionConsumer;
pub use error::ConsumerError;
pub use id::MessageID;
pub use id::TrackingMessageID;
pub use message::Message;
pub use state::ConsumerState;
