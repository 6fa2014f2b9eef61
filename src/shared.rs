//! State and collaborators shared by the partition consumer's actors.
//!
//! Per `spec.md` §5 the only fields crossing actor boundaries are the atomic state and
//! `start_message_id`/`last_dequeued_msg`; `available_permits` stays local to
//! [`crate::dispatch::DispatcherActor`] and the compression cache stays local to
//! [`crate::receive::ReceivePipeline`]. Both are constructed from this struct, not stored
//! on it, so the "exclusively owned" property is visible at the type level.
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::collaborators::Connection;
use crate::collaborators::ConsumerInterceptors;
use crate::collaborators::DlqRouter;
use crate::collaborators::LookupService;
use crate::collaborators::MessageCrypto;
use crate::collaborators::NackTracker;
use crate::collaborators::RpcClient;
use crate::compression::CompressionProviders;
use crate::config::ConsumerConfig;
use crate::id::MessageID;
use crate::state::AtomicConsumerState;

/// Everything a partition consumer's actors need beyond their private local state.
pub struct Shared {
    pub config: ConsumerConfig,
    pub consumer_id: u64,
    pub state: AtomicConsumerState,

    pub lookup: Arc<dyn LookupService>,
    pub rpc: Arc<dyn RpcClient>,
    pub crypto: Option<Arc<dyn MessageCrypto>>,
    pub dlq: Arc<dyn DlqRouter>,
    pub nack_tracker: Arc<dyn NackTracker>,
    pub interceptors: Arc<dyn ConsumerInterceptors>,

    /// Functionally owned by [`crate::receive::ReceivePipeline`] alone -- only it ever
    /// calls [`CompressionProviders::get`] -- but shutdown is driven by
    /// [`crate::events::EventsActor`], so the cache itself lives here.
    pub compression: CompressionProviders,

    /// The current broker connection, `None` while disconnected or reconnecting.
    pub connection: Mutex<Option<Arc<dyn Connection>>>,

    /// The effective start position used on (re)subscribe; refined on reconnect/seek by
    /// [`crate::connection::ConnectionManager`] from the dispatcher's clear-queue reply.
    pub start_message_id: Mutex<Option<MessageID>>,
    pub start_message_id_inclusive: Mutex<bool>,

    /// The last id the dispatcher delivered to the application, used to compute the
    /// resume point on reconnect when the prefetch queue was empty at disconnect.
    pub last_dequeued_msg: Mutex<Option<MessageID>>,
}

impl Shared {
    /// `true` if the broker should decide the durable cursor (no explicit start id is
    /// ever sent).
    pub fn durable(&self) -> bool {
        use crate::config::SubscriptionMode;
        matches!(self.config.subscription_mode, SubscriptionMode::Durable)
    }
}
