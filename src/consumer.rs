//! [`PartitionConsumer`]: the public facade wiring C1-C5 together.
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::collaborators::ConsumerInterceptors;
use crate::collaborators::DlqRouter;
use crate::collaborators::LookupService;
use crate::collaborators::MessageCrypto;
use crate::collaborators::NackTracker;
use crate::collaborators::RpcClient;
use crate::compression::CompressionProviders;
use crate::config::ConsumerConfig;
use crate::config::InitialPosition;
use crate::connection::ConnectionManager;
use crate::context::Context;
use crate::dispatch::ApplicationReceiver;
use crate::dispatch::DispatcherHandle;
use crate::error::ConsumerError;
use crate::events::EventsHandle;
use crate::id::AckHandle;
use crate::id::MessageID;
use crate::id::TrackingMessageID;
use crate::shared::Shared;
use crate::state::AtomicConsumerState;
use crate::state::ConsumerState;

/// The collaborators a caller must supply to construct a [`PartitionConsumer`].
///
/// Everything here is an external dependency per `spec.md` §1/§6: a binary embedding the
/// consumer provides concrete implementations and owns their lifecycle.
pub struct Collaborators {
    pub lookup: Arc<dyn LookupService>,
    pub rpc: Arc<dyn RpcClient>,
    pub crypto: Option<Arc<dyn MessageCrypto>>,
    pub compression: Arc<dyn crate::collaborators::CompressionProviderFactory>,
    pub dlq: Arc<dyn DlqRouter>,
    pub nack_tracker: Arc<dyn NackTracker>,
    pub interceptors: Arc<dyn ConsumerInterceptors>,
}

/// Forwards [`AckHandle::ack_id`] onto the events actor, giving out tracking ids a weak,
/// non-owning back reference (`spec.md` §9). Also the call site for `OnAcknowledge`
/// (`spec.md` §6): the interceptor runs once per broker-bound ack, right before it is
/// forwarded, since every ack that reaches the broker passes through here.
struct AckForwarder {
    shared: Arc<Shared>,
    events: EventsHandle,
}

#[async_trait]
impl AckHandle for AckForwarder {
    async fn ack_id(&self, id: MessageID) {
        self.shared.interceptors.on_acknowledge(id).await;
        self.events.ack(id).await;
    }
}

/// A per-partition broker subscription: flow-controlled prefetch, decrypt/decompress/
/// deframe pipeline, ack/nack/seek/unsubscribe, and transparent reconnection.
pub struct PartitionConsumer {
    shared: Arc<Shared>,
    events: EventsHandle,
    #[allow(dead_code)]
    dispatcher: DispatcherHandle,
    ack_forwarder: Arc<AckForwarder>,
}

impl PartitionConsumer {
    /// Construct and start a partition consumer: runs the start-position refinement,
    /// establishes the initial broker session, and spawns the three actors described in
    /// `spec.md` §5. Returns once the first `Subscribe` has succeeded, together with the
    /// receiver end of the application channel.
    pub async fn spawn(
        context: &Context,
        config: ConsumerConfig,
        collaborators: Collaborators,
    ) -> Result<(PartitionConsumer, ApplicationReceiver), ConsumerError> {
        let consumer_id = collaborators.rpc.new_consumer_id();
        let start_message_id = config.start_message_id.map(|start| start.id);
        let start_message_id_inclusive = config
            .start_message_id
            .map(|start| start.inclusive)
            .unwrap_or(false);
        let needs_latest_refinement =
            start_message_id_inclusive && matches!(config.initial_position, InitialPosition::Latest);

        let shared = Arc::new(Shared {
            config,
            consumer_id,
            state: AtomicConsumerState::new(ConsumerState::Initializing),
            lookup: collaborators.lookup,
            rpc: collaborators.rpc,
            crypto: collaborators.crypto,
            dlq: collaborators.dlq,
            nack_tracker: collaborators.nack_tracker,
            interceptors: collaborators.interceptors,
            compression: CompressionProviders::new(collaborators.compression),
            connection: tokio::sync::Mutex::new(None),
            start_message_id: tokio::sync::Mutex::new(start_message_id),
            start_message_id_inclusive: tokio::sync::Mutex::new(start_message_id_inclusive),
            last_dequeued_msg: tokio::sync::Mutex::new(None),
        });

        let (dispatcher, app_rx, prefetch_tx) =
            crate::dispatch::spawn(shared.clone(), context.clone());

        let (events, events_rx) = crate::events::channel();
        let ack_forwarder = Arc::new(AckForwarder {
            shared: shared.clone(),
            events: events.clone(),
        });
        let owner: Weak<dyn AckHandle> =
            Arc::downgrade(&(ack_forwarder.clone() as Arc<dyn AckHandle>));

        let (connection_closed_tx, connection_closed_rx) = mpsc::channel(1);
        let frame_handler = Arc::new(crate::receive::ReceivePipeline::new(
            shared.clone(),
            owner,
            prefetch_tx,
            connection_closed_tx,
            context.clone(),
        ));

        let connection_manager = ConnectionManager::new(
            shared.clone(),
            dispatcher.clone(),
            frame_handler,
        );

        if needs_latest_refinement {
            match connection_manager.get_last_message_id_initial(context).await {
                Ok(last_id) => {
                    connection_manager
                        .refine_initial_start_position(Some(last_id))
                        .await;
                }
                Err(error) => {
                    slog::warn!(context.logger, "Start-position refinement failed, falling back to broker-chosen Latest";
                        "error" => %error);
                }
            }
        }

        connection_manager.grab_conn(context).await?;

        crate::events::spawn(
            shared.clone(),
            connection_manager,
            dispatcher.clone(),
            connection_closed_rx,
            events_rx,
            context.clone(),
        );

        Ok((
            PartitionConsumer {
                shared,
                events,
                dispatcher,
                ack_forwarder,
            },
            app_rx,
        ))
    }

    /// Acknowledge a delivered message. Consults the batch tracker (if any) and sends
    /// the broker `Ack` only once every id sharing the batch has acked.
    pub async fn ack(&self, id: &TrackingMessageID) {
        id.ack().await;
    }

    /// Negative-acknowledge a message: hands it to the external nack tracker, which
    /// eventually requests its redelivery.
    pub async fn nack(&self, id: MessageID) {
        self.shared.interceptors.on_negative_acks_send(&[id]).await;
        self.shared.nack_tracker.add(id).await;
    }

    pub async fn unsubscribe(&self) -> Result<(), ConsumerError> {
        self.events.unsubscribe().await
    }

    pub async fn seek(&self, id: MessageID) -> Result<(), ConsumerError> {
        self.events.seek(id).await
    }

    pub async fn seek_by_time(&self, publish_time_ms: i64) -> Result<(), ConsumerError> {
        self.events.seek_by_time(publish_time_ms).await
    }

    pub async fn get_last_message_id(&self) -> Result<TrackingMessageID, ConsumerError> {
        let id = self.events.get_last_message_id().await?;
        let owner: Weak<dyn AckHandle> =
            Arc::downgrade(&(self.ack_forwarder.clone() as Arc<dyn AckHandle>));
        Ok(TrackingMessageID::new(id, owner, std::time::Instant::now()))
    }

    pub async fn close(&self) {
        self.events.close().await;
    }

    pub fn state(&self) -> ConsumerState {
        self.shared.state.load()
    }
}
