//! Errors surfaced by the partition consumer.
//!
//! Internal-only reasons (`ChecksumMismatch`, `DecryptionError`, `DecompressionError`,
//! `BatchDeSerializeError`) are never returned to callers of the public API: they are
//! caught inside [`crate::receive`] and turned into a broker ack carrying a validation
//! error, so the broker can release the message. They are still modelled as variants
//! here because [`crate::receive`] needs a typed way to decide which ack to send.
use thiserror::Error;

/// Errors that can be surfaced by the partition consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Resolving the partition's owning broker failed.
    #[error("failed to lookup broker for partition")]
    LookupFailed(#[source] anyhow::Error),

    /// The `Subscribe` RPC failed.
    #[error("failed to subscribe to partition")]
    SubscribeFailed(#[source] anyhow::Error),

    /// Broker frame metadata failed to parse (internal only, triggers an ack).
    #[error("broker frame metadata failed checksum validation")]
    ChecksumMismatch,

    /// Decompressing a broker payload failed (internal only, triggers an ack).
    #[error("failed to decompress message payload")]
    DecompressionError(#[source] anyhow::Error),

    /// Decrypting a broker payload failed (internal only, triggers an ack).
    #[error("failed to decrypt message payload")]
    DecryptionError(#[source] anyhow::Error),

    /// A batched message failed to deserialize (internal only, triggers an ack).
    #[error("failed to deserialize batched message")]
    BatchDeSerializeError(#[source] anyhow::Error),

    /// The broker returned a response of an unexpected type for the request sent.
    #[error("broker returned an unexpected response type")]
    UnexpectedMessage,

    /// The broker returned an explicit error response.
    #[error("broker error {code}: {message}")]
    BrokerError { code: String, message: String },

    /// A control-plane RPC (unsubscribe, seek, get-last-id, close) failed at the
    /// transport level, as opposed to receiving a broker `Error` response.
    #[error("control-plane request failed")]
    ControlRpcFailed(#[source] anyhow::Error),

    /// The consumer is closing or closed and the operation is a no-op.
    #[error("partition consumer is closing or has closed")]
    Closing,
}

impl ConsumerError {
    /// True for the internal-only reasons that must never reach the application, and
    /// instead drive a broker-side ack with a validation error (see `spec.md` §7).
    pub fn is_internal_only(&self) -> bool {
        matches!(
            self,
            ConsumerError::ChecksumMismatch
                | ConsumerError::DecompressionError(_)
                | ConsumerError::DecryptionError(_)
                | ConsumerError::BatchDeSerializeError(_)
        )
    }
}

/// Exceeded the configured maximum number of reconnect attempts.
#[derive(Debug, Error)]
#[error("exceeded maximum of {0} reconnect attempts")]
pub struct ReconnectAttemptsExceeded(pub u32);
