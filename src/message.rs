//! The application-visible [`Message`] delivered by the receive pipeline.
use std::collections::HashMap;
use std::sync::Arc;

use crate::id::TrackingMessageID;

/// Encryption context attached to a message whose payload could not be decrypted but was
/// still delivered under [`crate::config::CryptoFailureAction::Consume`].
#[derive(Clone, Debug)]
pub struct EncryptionContext {
    pub algorithm: String,
    pub param: Vec<u8>,
    pub keys: HashMap<String, Vec<u8>>,
}

/// A single message delivered to the application.
///
/// Payload is owned exclusively by this message; the schema reference is a name only,
/// as schema resolution is an external collaborator (see `spec.md` §1).
#[derive(Clone, Debug)]
pub struct Message {
    pub id: TrackingMessageID,
    pub publish_time_ms: i64,
    pub event_time_ms: i64,
    pub key: Option<String>,
    pub producer_name: String,
    pub properties: HashMap<String, String>,
    pub topic: Arc<str>,
    pub payload: Vec<u8>,
    pub schema_name: Option<String>,
    pub replicated_clusters: Vec<String>,
    pub replicated_from: Option<String>,
    pub redelivery_count: u32,
    pub encryption_context: Option<EncryptionContext>,
    /// Set when the payload could not be decrypted but was delivered anyway under the
    /// `Consume` crypto failure action. A message flagged this way is never deframed as
    /// a batch, regardless of `NumMessagesInBatch`.
    pub undecryptable: bool,
}

impl Message {
    /// `true` if this message is part of a batch whose broker ack is still pending other
    /// entries in the same batch.
    pub fn is_batched(&self) -> bool {
        self.id.id().batch_index >= 0
    }
}
