//! Message identity: [`MessageID`], [`TrackingMessageID`] and [`BatchAckTracker`].
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

/// A broker-assigned message identity: `(ledgerId, entryId, batchIndex, partitionIndex)`.
///
/// `entry_id == -1` denotes "no entry" (e.g. the result of `GetLastMessageId` on an
/// empty topic). `batch_index == -1` denotes a non-batched message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageID {
    pub ledger_id: i64,
    pub entry_id: i64,
    pub batch_index: i32,
    pub partition_index: i32,
}

impl MessageID {
    /// Construct a non-batched id.
    pub const fn new(ledger_id: i64, entry_id: i64, partition_index: i32) -> MessageID {
        MessageID {
            ledger_id,
            entry_id,
            batch_index: -1,
            partition_index,
        }
    }

    /// Construct an id for entry `index` of a batch.
    pub const fn batched(
        ledger_id: i64,
        entry_id: i64,
        batch_index: i32,
        partition_index: i32,
    ) -> MessageID {
        MessageID {
            ledger_id,
            entry_id,
            batch_index,
            partition_index,
        }
    }

    /// Result of `GetLastMessageId` on a topic with no entries.
    pub const fn no_entry(partition_index: i32) -> MessageID {
        MessageID::new(-1, -1, partition_index)
    }

    /// `true` if this id is ordered strictly before `other`.
    pub fn less(&self, other: &MessageID) -> bool {
        other.greater(self)
    }

    /// `true` if this id is ordered strictly after `other`.
    pub fn greater(&self, other: &MessageID) -> bool {
        self.compare(other) == std::cmp::Ordering::Greater
    }

    /// `true` if this id is ordered at or after `other`.
    pub fn greater_equal(&self, other: &MessageID) -> bool {
        matches!(
            self.compare(other),
            std::cmp::Ordering::Greater | std::cmp::Ordering::Equal
        )
    }

    /// Total order over `(ledger_id, entry_id, batch_index)`; `partition_index` does
    /// not participate since comparisons are only meaningful within one partition.
    pub fn compare(&self, other: &MessageID) -> std::cmp::Ordering {
        (self.ledger_id, self.entry_id, self.batch_index).cmp(&(
            other.ledger_id,
            other.entry_id,
            other.batch_index,
        ))
    }

    /// The id immediately preceding this one: decrements `batch_index` when it is a
    /// valid batch position, otherwise decrements `entry_id` and clears `batch_index`.
    pub fn previous(&self) -> MessageID {
        if self.batch_index >= 0 {
            MessageID {
                batch_index: self.batch_index - 1,
                ..*self
            }
        } else {
            MessageID {
                entry_id: self.entry_id - 1,
                ..*self
            }
        }
    }
}

/// Counts acks for one batch; `ack(i)` returns `true` exactly once, on the transition
/// that marks the final outstanding index.
///
/// Exactly one tracker exists per inbound batch, shared by the `N` tracking ids that
/// batch yields. It is dropped once all indices have acked or the prefetch queue is
/// cleared (callers simply drop their `Arc` reference).
pub struct BatchAckTracker {
    acked: Mutex<Vec<bool>>,
    outstanding: AtomicUsize,
}

impl BatchAckTracker {
    /// Create a tracker for a batch of `size` entries.
    pub fn new(size: usize) -> Arc<BatchAckTracker> {
        Arc::new(BatchAckTracker {
            acked: Mutex::new(vec![false; size]),
            outstanding: AtomicUsize::new(size),
        })
    }

    /// Mark index `i` as acked. Returns `true` exactly once, the first time all `N`
    /// indices have been marked -- that is the signal to emit the single broker `Ack`.
    pub fn ack(&self, index: usize) -> bool {
        let mut acked = self.acked.lock().expect("BatchAckTracker mutex poisoned");
        if acked[index] {
            // Idempotent: acking the same index twice never re-triggers completion.
            return false;
        }
        acked[index] = true;
        drop(acked);
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// A [`MessageID`] enriched with received-time and ack-closure bookkeeping.
///
/// The back reference to the owning consumer is weak and non-owning: the consumer may
/// close and drop its handle while tracking ids are still held by the application.
/// When that happens [`TrackingMessageID::ack`] silently becomes a no-op, as the
/// handle's upgrade fails.
#[derive(Clone)]
pub struct TrackingMessageID {
    id: MessageID,
    owner: Weak<dyn AckHandle>,
    received_at: Instant,
    batch: Option<Arc<BatchAckTracker>>,
    batch_index: Option<usize>,
}

/// Minimal surface a [`TrackingMessageID`] needs to call back into its owning consumer.
///
/// This is deliberately narrower than the full `PartitionConsumer` so tracking ids can
/// outlive the consumer's other internals without keeping them alive via `Arc`.
#[async_trait::async_trait]
pub trait AckHandle: Send + Sync {
    /// Request an individual ack for `id` be sent to the broker.
    async fn ack_id(&self, id: MessageID);
}

impl TrackingMessageID {
    /// Construct a tracking id for a non-batched message.
    pub fn new(id: MessageID, owner: Weak<dyn AckHandle>, received_at: Instant) -> TrackingMessageID {
        TrackingMessageID {
            id,
            owner,
            received_at,
            batch: None,
            batch_index: None,
        }
    }

    /// Construct a tracking id for entry `batch_index` of a batch sharing `tracker`.
    pub fn batched(
        id: MessageID,
        owner: Weak<dyn AckHandle>,
        received_at: Instant,
        tracker: Arc<BatchAckTracker>,
        batch_index: usize,
    ) -> TrackingMessageID {
        TrackingMessageID {
            id,
            owner,
            received_at,
            batch: Some(tracker),
            batch_index: Some(batch_index),
        }
    }

    /// The underlying [`MessageID`].
    pub fn id(&self) -> MessageID {
        self.id
    }

    /// When this id was received by the client.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// `true` for a tracking id with no valid underlying message (e.g. `GetLastMessageId`
    /// on an empty topic, or a default-constructed id never assigned by the broker).
    pub fn undefined(&self) -> bool {
        self.id.entry_id < 0
    }

    pub fn equal(&self, other: &TrackingMessageID) -> bool {
        self.id == other.id
    }

    pub fn greater(&self, other: &TrackingMessageID) -> bool {
        self.id.greater(&other.id)
    }

    pub fn greater_equal(&self, other: &TrackingMessageID) -> bool {
        self.id.greater_equal(&other.id)
    }

    /// Consult the batch tracker (if any) and ack the broker only once every id
    /// sharing this id's batch has acked; for non-batched ids this always sends.
    ///
    /// A no-op for `undefined` ids and for ids whose owning consumer has been dropped.
    pub async fn ack(&self) {
        if self.undefined() {
            return;
        }
        let should_send = match (&self.batch, self.batch_index) {
            (Some(tracker), Some(index)) => tracker.ack(index),
            _ => true,
        };
        if !should_send {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.ack_id(self.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct RecordingOwner {
        acked: StdAtomicUsize,
    }

    #[async_trait::async_trait]
    impl AckHandle for RecordingOwner {
        async fn ack_id(&self, _id: MessageID) {
            self.acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn previous_decrements_batch_index() {
        let id = MessageID::batched(1, 2, 3, 0);
        assert_eq!(id.previous(), MessageID::batched(1, 2, 2, 0));
    }

    #[test]
    fn previous_decrements_entry_when_not_batched() {
        let id = MessageID::new(1, 2, 0);
        assert_eq!(id.previous(), MessageID::new(1, 1, 0));
    }

    #[test]
    fn ordering_matches_ledger_entry_batch() {
        let a = MessageID::new(1, 1, 0);
        let b = MessageID::new(1, 2, 0);
        assert!(b.greater(&a));
        assert!(b.greater_equal(&a));
        assert!(!a.greater(&b));
    }

    #[tokio::test]
    async fn batch_tracker_acks_once_all_indices_marked() {
        let tracker = BatchAckTracker::new(3);
        assert!(!tracker.ack(0));
        assert!(!tracker.ack(2));
        assert!(tracker.ack(1));
        // Re-acking an already-acked index is idempotent and never re-fires.
        assert!(!tracker.ack(1));
    }

    #[tokio::test]
    async fn tracking_id_acks_broker_only_after_batch_completes() {
        let owner = Arc::new(RecordingOwner {
            acked: StdAtomicUsize::new(0),
        });
        let weak: Weak<dyn AckHandle> = Arc::downgrade(&(owner.clone() as Arc<dyn AckHandle>));
        let tracker = BatchAckTracker::new(3);
        let now = Instant::now();
        let id0 = TrackingMessageID::batched(
            MessageID::batched(7, 3, 0, 0),
            weak.clone(),
            now,
            tracker.clone(),
            0,
        );
        let id1 = TrackingMessageID::batched(
            MessageID::batched(7, 3, 1, 0),
            weak.clone(),
            now,
            tracker.clone(),
            1,
        );
        let id2 =
            TrackingMessageID::batched(MessageID::batched(7, 3, 2, 0), weak, now, tracker, 2);

        id0.ack().await;
        id2.ack().await;
        assert_eq!(owner.acked.load(Ordering::Relaxed), 0);
        id1.ack().await;
        assert_eq!(owner.acked.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ack_is_noop_when_owner_dropped() {
        let owner = Arc::new(RecordingOwner {
            acked: StdAtomicUsize::new(0),
        });
        let weak: Weak<dyn AckHandle> = Arc::downgrade(&(owner.clone() as Arc<dyn AckHandle>));
        drop(owner);
        let id = TrackingMessageID::new(MessageID::new(1, 1, 0), weak, Instant::now());
        id.ack().await;
    }

    #[tokio::test]
    async fn ack_is_noop_for_undefined_id() {
        let owner = Arc::new(RecordingOwner {
            acked: StdAtomicUsize::new(0),
        });
        let weak: Weak<dyn AckHandle> = Arc::downgrade(&(owner.clone() as Arc<dyn AckHandle>));
        let id = TrackingMessageID::new(MessageID::no_entry(0), weak, Instant::now());
        id.ack().await;
        assert_eq!(owner.acked.load(Ordering::Relaxed), 0);
    }
}
