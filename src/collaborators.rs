//! Contracts for collaborators the partition consumer depends on but does not own.
//!
//! Each trait here corresponds to one of the "excluded, interfaces only" components
//! listed in `spec.md` §1: broker lookup, the RPC transport, the raw connection, message
//! decryption, compression, DLQ routing, negative-ack tracking and interceptors. A
//! binary embedding the consumer supplies concrete implementations; this crate only
//! consumes them through these traits.
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;
use crate::wire::CompressionType;
use crate::wire::MessageMetadata;

/// A broker address pair returned by topic lookup.
#[derive(Clone, Debug)]
pub struct BrokerAddress {
    pub logical: String,
    pub physical: String,
}

/// Resolves which broker currently owns a topic partition.
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn lookup(&self, topic: &str) -> anyhow::Result<BrokerAddress>;
}

/// Opaque identifier for a specific broker connection, handed out by [`RpcClient`].
pub type ConnectionId = u64;

/// Issues broker requests and allocates the consumer/request id namespaces.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Allocate a consumer id unique for the lifetime of the owning top-level client.
    fn new_consumer_id(&self) -> u64;

    /// Allocate a request id unique for the lifetime of the owning top-level client.
    fn new_request_id(&self) -> u64;

    /// Open (or reuse) the connection to `addr` used for subsequent `request_on_cnx*` calls.
    async fn connect(&self, addr: &BrokerAddress) -> anyhow::Result<std::sync::Arc<dyn Connection>>;

    /// Open (or reuse) a connection to `addr` and send `command`, waiting for a response.
    async fn request(
        &self,
        addr: &BrokerAddress,
        request_id: u64,
        command: OutboundCommand,
    ) -> anyhow::Result<crate::wire::Response>;

    /// Send `command` on an already-established connection and wait for a response.
    async fn request_on_cnx(
        &self,
        connection: ConnectionId,
        request_id: u64,
        command: OutboundCommand,
    ) -> anyhow::Result<crate::wire::Response>;

    /// Send `command` on an established connection without waiting for a response.
    async fn request_on_cnx_no_wait(&self, connection: ConnectionId, command: OutboundCommand);
}

/// Any outbound command the consumer can send through [`RpcClient`].
#[derive(Clone, Debug)]
pub enum OutboundCommand {
    Subscribe(crate::wire::Subscribe),
    Flow(crate::wire::Flow),
    Ack(crate::wire::Ack),
    RedeliverUnacknowledged(crate::wire::RedeliverUnacknowledged),
    Seek(crate::wire::Seek),
    Unsubscribe(crate::wire::Unsubscribe),
    CloseConsumer(crate::wire::CloseConsumer),
    GetLastMessageId(crate::wire::GetLastMessageId),
}

impl From<crate::wire::Ack> for OutboundCommand {
    fn from(value: crate::wire::Ack) -> Self {
        OutboundCommand::Ack(value)
    }
}

impl From<crate::wire::RedeliverUnacknowledged> for OutboundCommand {
    fn from(value: crate::wire::RedeliverUnacknowledged) -> Self {
        OutboundCommand::RedeliverUnacknowledged(value)
    }
}

/// Callback invoked by the connection layer for each inbound frame addressed to this
/// consumer's id.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn message_received(&self, frame: crate::wire::InboundMessage);
    async fn connection_closed(&self);
}

/// The raw, already-framed connection to one broker. Frame encoding/decoding and TLS/auth
/// handshakes are out of scope (`spec.md` §1); this only models handler registration.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;
    async fn add_consume_handler(&self, consumer_id: u64, handler: std::sync::Arc<dyn FrameHandler>);
    async fn delete_consume_handler(&self, consumer_id: u64);
}

/// Decrypts broker payloads using keys resolved by an external key reader.
#[async_trait]
pub trait MessageCrypto: Send + Sync {
    async fn decrypt(
        &self,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Failure modes [`MessageCrypto::decrypt`] can report.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key reader configured for encrypted message")]
    NoKeyReader,
    #[error("decryption failed")]
    Failed(#[source] anyhow::Error),
}

/// Decompresses a payload of a known [`CompressionType`].
#[async_trait]
pub trait CompressionProvider: Send + Sync {
    fn decompress(&self, src: &[u8], uncompressed_size: u32) -> anyhow::Result<Vec<u8>>;
    async fn close(&self);
}

/// Produces a [`CompressionProvider`] for a compression type, lazily and once per type.
pub trait CompressionProviderFactory: Send + Sync {
    fn provider_for(&self, compression: CompressionType) -> Box<dyn CompressionProvider>;
}

/// Decides whether a message should be diverted to the dead-letter queue and exposes the
/// channel to write it to.
#[async_trait]
pub trait DlqRouter: Send + Sync {
    fn should_send_to_dlq(&self, message: &Message) -> bool;
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Tracks nacked ids and eventually requests their redelivery.
#[async_trait]
pub trait NackTracker: Send + Sync {
    async fn add(&self, id: crate::id::MessageID);
    async fn close(&self);
}

/// Consumer-side interception hooks.
#[async_trait]
pub trait ConsumerInterceptors: Send + Sync {
    async fn before_consume(&self, message: Message) -> Message;
    async fn on_acknowledge(&self, id: crate::id::MessageID);
    async fn on_negative_acks_send(&self, ids: &[crate::id::MessageID]);
}

/// Per-message encryption keys as carried in [`MessageMetadata::encryption_keys`],
/// resolved by an external key reader. Modelled here only as the map `decrypt` expects
/// a [`MessageCrypto`] implementation to resolve internally.
pub type EncryptionKeyMap = HashMap<String, Vec<u8>>;
