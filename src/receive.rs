//! The receive pipeline (C3): decrypt, decompress, deframe, filter, and enqueue inbound
//! frames (`spec.md` §4.3).
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::collaborators::CryptoError;
use crate::collaborators::FrameHandler;
use crate::collaborators::OutboundCommand;
use crate::config::CryptoFailureAction;
use crate::context::Context;
use crate::dispatch::PrefetchBatch;
use crate::id::BatchAckTracker;
use crate::id::MessageID;
use crate::id::TrackingMessageID;
use crate::message::EncryptionContext;
use crate::message::Message;
use crate::shared::Shared;
use crate::wire::InboundMessage;
use crate::wire::MessageMetadata;
use crate::wire::SingleMessageMetadata;
use crate::wire::ValidationError;

pub struct ReceivePipeline {
    shared: Arc<Shared>,
    owner: std::sync::Weak<dyn crate::id::AckHandle>,
    prefetch: mpsc::Sender<PrefetchBatch>,
    reconnect_notify: mpsc::Sender<()>,
    context: Context,
}

impl ReceivePipeline {
    pub fn new(
        shared: Arc<Shared>,
        owner: std::sync::Weak<dyn crate::id::AckHandle>,
        prefetch: mpsc::Sender<PrefetchBatch>,
        reconnect_notify: mpsc::Sender<()>,
        context: Context,
    ) -> ReceivePipeline {
        ReceivePipeline {
            shared,
            owner,
            prefetch,
            reconnect_notify,
            context,
        }
    }

    async fn process(&self, frame: InboundMessage) -> Result<(), crate::error::ConsumerError> {
        let id = frame.message_id;

        let metadata = match MessageMetadata::parse(&frame.metadata_bytes) {
            Ok(metadata) => metadata,
            Err(reason) => {
                crate::telemetry::RECEIVE_ERR
                    .with_label_values(&["checksum"])
                    .inc();
                self.send_ack(id, Some(reason)).await;
                return Err(crate::error::ConsumerError::ChecksumMismatch);
            }
        };

        let (payload, undecryptable) = match self.decrypt(&metadata, &frame.payload).await {
            Stage::Continue(payload, undecryptable) => (payload, undecryptable),
            Stage::DiscardWithAck(reason) => {
                self.send_ack(id, Some(reason)).await;
                return Ok(());
            }
            Stage::DropSilently => return Ok(()),
        };

        if undecryptable {
            let message = self.build_message(
                id,
                frame.redelivery_count,
                &metadata,
                &SingleMessageMetadata::default(),
                payload,
                true,
                None,
                None,
            );
            self.filter_and_enqueue(vec![message]).await;
            return Ok(());
        }

        let decompressed = self
            .shared
            .compression
            .get(metadata.compression)
            .await
            .decompress(&payload, metadata.uncompressed_size)
            .map_err(crate::error::ConsumerError::DecompressionError);
        let decompressed = match decompressed {
            Ok(bytes) => bytes,
            Err(error) => {
                crate::telemetry::RECEIVE_ERR
                    .with_label_values(&["decompress"])
                    .inc();
                self.send_ack(id, Some(ValidationError::DecompressionError))
                    .await;
                return Err(error);
            }
        };

        let entries = match deframe(&decompressed, metadata.num_messages_in_batch) {
            Ok(entries) => entries,
            Err(error) => {
                crate::telemetry::RECEIVE_ERR
                    .with_label_values(&["deframe"])
                    .inc();
                self.send_ack(id, Some(ValidationError::BatchDeSerializeError))
                    .await;
                return Err(error);
            }
        };

        let batched = entries.len() > 1;
        let tracker = batched.then(|| BatchAckTracker::new(entries.len()));
        let mut messages = Vec::with_capacity(entries.len());
        for (index, (single_metadata, payload)) in entries.into_iter().enumerate() {
            let entry_id = if batched {
                MessageID::batched(id.ledger_id, id.entry_id, index as i32, id.partition_index)
            } else {
                id
            };
            let message = self.build_message(
                entry_id,
                frame.redelivery_count,
                &metadata,
                &single_metadata,
                payload,
                false,
                tracker.clone(),
                batched.then_some(index),
            );
            messages.push(message);
        }

        self.filter_and_enqueue(messages).await;
        Ok(())
    }

    async fn decrypt(&self, metadata: &MessageMetadata, payload: &[u8]) -> Stage {
        if metadata.encryption_keys.is_empty() {
            return Stage::Continue(payload.to_vec(), false);
        }
        let action = self.shared.config.crypto_failure_action;
        let crypto = match &self.shared.crypto {
            None => return self.crypto_failure(action, None),
            Some(crypto) => crypto,
        };
        match crypto.decrypt(metadata, payload).await {
            Ok(plaintext) => Stage::Continue(plaintext, false),
            Err(CryptoError::NoKeyReader) => self.crypto_failure(action, None),
            Err(_) => {
                crate::telemetry::RECEIVE_ERR
                    .with_label_values(&["decrypt"])
                    .inc();
                self.crypto_failure(action, Some(payload.to_vec()))
            }
        }
    }

    fn crypto_failure(&self, action: CryptoFailureAction, payload: Option<Vec<u8>>) -> Stage {
        match action {
            CryptoFailureAction::Consume => {
                Stage::Continue(payload.unwrap_or_default(), true)
            }
            CryptoFailureAction::Discard => Stage::DiscardWithAck(ValidationError::DecryptionError),
            CryptoFailureAction::FailConsume => Stage::DropSilently,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_message(
        &self,
        id: MessageID,
        redelivery_count: u32,
        frame_metadata: &MessageMetadata,
        single_metadata: &SingleMessageMetadata,
        payload: Vec<u8>,
        undecryptable: bool,
        tracker: Option<Arc<BatchAckTracker>>,
        batch_index: Option<usize>,
    ) -> Message {
        let received_at = std::time::Instant::now();
        let tracking_id = match (tracker, batch_index) {
            (Some(tracker), Some(index)) => {
                TrackingMessageID::batched(id, self.owner.clone(), received_at, tracker, index)
            }
            _ => TrackingMessageID::new(id, self.owner.clone(), received_at),
        };
        let encryption_context = (!frame_metadata.encryption_keys.is_empty()).then(|| {
            EncryptionContext {
                algorithm: frame_metadata
                    .encryption_algo
                    .clone()
                    .unwrap_or_default(),
                param: frame_metadata.encryption_param.clone().unwrap_or_default(),
                keys: std::collections::HashMap::new(),
            }
        });
        Message {
            id: tracking_id,
            publish_time_ms: frame_metadata.publish_time_ms,
            event_time_ms: if single_metadata.event_time_ms != 0 {
                single_metadata.event_time_ms
            } else {
                frame_metadata.event_time_ms
            },
            key: single_metadata
                .partition_key
                .clone()
                .or_else(|| frame_metadata.partition_key.clone()),
            producer_name: frame_metadata.producer_name.clone(),
            properties: if single_metadata.properties.is_empty() {
                frame_metadata.properties.clone()
            } else {
                single_metadata.properties.clone()
            },
            topic: Arc::from(self.shared.config.topic.as_str()),
            payload,
            schema_name: None,
            replicated_clusters: frame_metadata.replicate_to.clone(),
            replicated_from: frame_metadata.replicated_from.clone(),
            redelivery_count,
            encryption_context,
            undecryptable,
        }
    }

    /// Apply start-position filtering then push the surviving messages of a (possibly
    /// partial) batch onto the bounded prefetch queue. Pushing blocks the frame handler
    /// when the queue is full -- this is the intended backpressure point.
    async fn filter_and_enqueue(&self, messages: Vec<Message>) {
        let mut surviving = Vec::with_capacity(messages.len());
        for message in messages {
            let id = message.id.id();
            if self.should_be_discarded(id).await {
                self.send_ack(id, None).await;
                crate::telemetry::DISCARDED_COUNT.inc();
                continue;
            }
            let message = self.shared.interceptors.before_consume(message).await;
            surviving.push(message);
        }
        if surviving.is_empty() {
            return;
        }
        crate::telemetry::PREFETCHED_MESSAGES.add(surviving.len() as f64);
        if self.prefetch.send(surviving).await.is_err() {
            slog::warn!(self.context.logger, "Prefetch queue closed, dropping batch");
        }
    }

    /// `spec.md` §4.3 discard predicate.
    async fn should_be_discarded(&self, id: MessageID) -> bool {
        let start = *self.shared.start_message_id.lock().await;
        let start = match start {
            None => return false,
            Some(start) => start,
        };
        if matches!(
            self.shared.config.initial_position,
            crate::config::InitialPosition::Latest
        ) {
            return false;
        }
        let inclusive = *self.shared.start_message_id_inclusive.lock().await;
        if inclusive {
            start.greater(&id)
        } else {
            start.greater_equal(&id)
        }
    }

    async fn send_ack(&self, id: MessageID, validation_error: Option<ValidationError>) {
        let conn = self.shared.connection.lock().await.clone();
        let conn = match conn {
            Some(conn) => conn,
            None => return,
        };
        let command = OutboundCommand::Ack(crate::wire::Ack {
            consumer_id: self.shared.consumer_id,
            message_ids: vec![id],
            validation_error,
        });
        self.shared
            .rpc
            .request_on_cnx_no_wait(conn.id(), command)
            .await;
    }
}

enum Stage {
    Continue(Vec<u8>, bool),
    DiscardWithAck(ValidationError),
    DropSilently,
}

#[async_trait]
impl FrameHandler for ReceivePipeline {
    async fn message_received(&self, frame: InboundMessage) {
        if let Err(error) = self.process(frame).await {
            slog::warn!(self.context.logger, "Receive pipeline failed to process a frame";
                "error" => %error);
        }
    }

    async fn connection_closed(&self) {
        let _ = self.reconnect_notify.send(()).await;
    }
}

/// Split a decompressed batch payload into per-entry `(metadata, payload)` pairs.
///
/// Each entry is encoded as a big-endian `u32` metadata length, the metadata itself
/// (JSON-encoded [`SingleMessageMetadata`]), a big-endian `u32` payload length, and the
/// payload bytes. A non-batched message (`num_in_batch` absent or `1`) is returned as a
/// single entry with default metadata and the whole payload.
pub fn deframe(
    payload: &[u8],
    num_in_batch: Option<i32>,
) -> Result<Vec<(SingleMessageMetadata, Vec<u8>)>, crate::error::ConsumerError> {
    let count = num_in_batch.unwrap_or(1);
    if count <= 1 {
        return Ok(vec![(SingleMessageMetadata::default(), payload.to_vec())]);
    }

    let fail = |msg: &str| {
        crate::error::ConsumerError::BatchDeSerializeError(anyhow::anyhow!(msg.to_string()))
    };
    let mut entries = Vec::with_capacity(count as usize);
    let mut cursor = payload;
    for _ in 0..count {
        if cursor.len() < 4 {
            return Err(fail("truncated metadata length prefix"));
        }
        let (len_bytes, rest) = cursor.split_at(4);
        let meta_len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        if rest.len() < meta_len {
            return Err(fail("truncated metadata"));
        }
        let (meta_bytes, rest) = rest.split_at(meta_len);
        let metadata: SingleMessageMetadata =
            serde_json::from_slice(meta_bytes).map_err(|error| {
                crate::error::ConsumerError::BatchDeSerializeError(error.into())
            })?;

        if rest.len() < 4 {
            return Err(fail("truncated payload length prefix"));
        }
        let (payload_len_bytes, rest) = rest.split_at(4);
        let payload_len = u32::from_be_bytes(payload_len_bytes.try_into().unwrap()) as usize;
        if rest.len() < payload_len {
            return Err(fail("truncated payload"));
        }
        let (entry_payload, remaining) = rest.split_at(payload_len);
        entries.push((metadata, entry_payload.to_vec()));
        cursor = remaining;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_entry(metadata: &SingleMessageMetadata, payload: &[u8]) -> Vec<u8> {
        let meta_bytes = serde_json::to_vec(metadata).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&meta_bytes);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn non_batched_passthrough() {
        let entries = deframe(b"hello", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"hello");
    }

    #[test]
    fn deframes_three_entries_in_order() {
        let mut payload = Vec::new();
        for i in 0..3u8 {
            payload.extend(encode_entry(&SingleMessageMetadata::default(), &[i]));
        }
        let entries = deframe(&payload, Some(3)).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, vec![0]);
        assert_eq!(entries[1].1, vec![1]);
        assert_eq!(entries[2].1, vec![2]);
    }

    #[test]
    fn truncated_batch_is_rejected() {
        let result = deframe(&[0, 0, 0, 10], Some(2));
        assert!(result.is_err());
    }
}
