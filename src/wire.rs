//! Logical shapes of the commands exchanged with the broker.
//!
//! These model the protobuf `BaseCommand` frames described in `spec.md` §6 as plain Rust
//! types. Byte-level protobuf framing of the outer `BaseCommand` envelope belongs to the
//! connection layer (an external collaborator, see [`crate::collaborators::Connection`]);
//! the one exception is [`MessageMetadata`], which `spec.md` §4.3 assigns to the receive
//! pipeline itself ("Metadata parse. On malformed header -> discard with `ChecksumMismatch`
//! ack and propagate error") -- see [`MessageMetadata::parse`].
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::config::CryptoFailureAction;
use crate::config::InitialPosition;
use crate::config::SubscriptionType;
use crate::id::MessageID;

/// A compression codec announced in message metadata.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Zlib,
    Lz4,
    Zstd,
}

/// Outbound `Subscribe` command fields (see `spec.md` §4.1).
#[derive(Clone, Debug)]
pub struct Subscribe {
    pub topic: String,
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    pub consumer_id: u64,
    pub request_id: u64,
    pub durable: bool,
    pub start_message_id: Option<MessageID>,
    pub start_message_id_inclusive: bool,
    pub initial_position: InitialPosition,
    pub metadata: HashMap<String, String>,
    pub replicate_subscription_state: bool,
    pub read_compacted: bool,
    /// Defaults to `true` on the wire; set `false` via `disable_force_topic_creation`.
    pub force_topic_creation: bool,
}

/// Outbound `Flow{consumerId, messagePermits}`.
#[derive(Clone, Copy, Debug)]
pub struct Flow {
    pub consumer_id: u64,
    pub message_permits: u32,
}

/// A validation reason attached to an `Ack` for an internally-discarded message.
///
/// Mirrors the four internal-only [`crate::error::ConsumerError`] variants that never
/// reach the application (`spec.md` §7).
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ValidationError {
    ChecksumMismatch,
    DecryptionError,
    DecompressionError,
    BatchDeSerializeError,
}

/// Outbound `Ack{consumerId, messageId[], ackType=Individual, validationError?}`.
#[derive(Clone, Debug)]
pub struct Ack {
    pub consumer_id: u64,
    pub message_ids: Vec<MessageID>,
    pub validation_error: Option<ValidationError>,
}

/// Outbound `RedeliverUnacknowledgedMessages{consumerId, messageIds[]}`.
#[derive(Clone, Debug)]
pub struct RedeliverUnacknowledged {
    pub consumer_id: u64,
    pub message_ids: Vec<MessageID>,
}

/// The position a `Seek` targets: an explicit id, or a publish-time threshold in
/// milliseconds (wire field `MessagePublishTime`).
#[derive(Clone, Copy, Debug)]
pub enum SeekTarget {
    MessageId(MessageID),
    PublishTimeMs(i64),
}

/// Outbound `Seek{consumerId, requestId, messageId | messagePublishTime}`.
#[derive(Clone, Copy, Debug)]
pub struct Seek {
    pub consumer_id: u64,
    pub request_id: u64,
    pub target: SeekTarget,
}

/// Outbound `Unsubscribe{requestId, consumerId}`.
#[derive(Clone, Copy, Debug)]
pub struct Unsubscribe {
    pub request_id: u64,
    pub consumer_id: u64,
}

/// Outbound `CloseConsumer{requestId, consumerId}`.
#[derive(Clone, Copy, Debug)]
pub struct CloseConsumer {
    pub request_id: u64,
    pub consumer_id: u64,
}

/// Outbound `GetLastMessageId{requestId, consumerId}`.
#[derive(Clone, Copy, Debug)]
pub struct GetLastMessageId {
    pub request_id: u64,
    pub consumer_id: u64,
}

/// Per-entry metadata within a batch (or the sole entry of a non-batched message).
///
/// Encoded as length-prefixed JSON ahead of each entry's payload within a batch; see
/// [`crate::receive::deframe`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SingleMessageMetadata {
    pub properties: HashMap<String, String>,
    pub partition_key: Option<String>,
    pub event_time_ms: i64,
}

/// The `MessageMetadata` header preceding a frame's payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub num_messages_in_batch: Option<i32>,
    pub compression: CompressionType,
    pub uncompressed_size: u32,
    pub encryption_keys: Vec<String>,
    pub encryption_algo: Option<String>,
    pub encryption_param: Option<Vec<u8>>,
    pub publish_time_ms: i64,
    pub event_time_ms: i64,
    pub partition_key: Option<String>,
    pub producer_name: String,
    pub properties: HashMap<String, String>,
    pub replicate_to: Vec<String>,
    pub replicated_from: Option<String>,
}

impl MessageMetadata {
    /// Parse a `MessageMetadata` header out of its encoded bytes (`spec.md` §4.3 step 1).
    ///
    /// A malformed header is reported as [`ValidationError::ChecksumMismatch`], matching
    /// the broker-side meaning of a header the client cannot make sense of.
    pub fn parse(bytes: &[u8]) -> Result<MessageMetadata, ValidationError> {
        serde_json::from_slice(bytes).map_err(|_| ValidationError::ChecksumMismatch)
    }
}

/// Inbound `Message{messageId, redeliveryCount, headersAndPayload}`.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub message_id: MessageID,
    pub redelivery_count: u32,
    /// The still-undecoded `MessageMetadata` header; see [`MessageMetadata::parse`].
    pub metadata_bytes: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Inbound `Success` with no further payload, used to confirm `Subscribe`/`Unsubscribe`/
/// `CloseConsumer`/`Seek`.
#[derive(Clone, Copy, Debug)]
pub struct Success {
    pub request_id: u64,
}

/// Inbound `Error{error, message}`.
#[derive(Clone, Debug)]
pub struct BrokerErrorResponse {
    pub request_id: u64,
    pub code: String,
    pub message: String,
}

/// Inbound `GetLastMessageIdResponse{lastMessageId}`.
#[derive(Clone, Copy, Debug)]
pub struct GetLastMessageIdResponse {
    pub request_id: u64,
    pub last_message_id: MessageID,
}

/// Any inbound response to a request-carrying RPC.
#[derive(Clone, Debug)]
pub enum Response {
    Success(Success),
    Error(BrokerErrorResponse),
    LastMessageId(GetLastMessageIdResponse),
}

/// Crypto failure action re-exported here for collaborators that only need the wire
/// vocabulary; the authoritative definition lives in [`crate::config`].
pub type CryptoAction = CryptoFailureAction;
