//! The connection manager (C1): establishes and re-establishes the broker session.
use std::sync::Arc;

use crate::collaborators::FrameHandler;
use crate::collaborators::OutboundCommand;
use crate::context::Context;
use crate::dispatch::DispatcherHandle;
use crate::error::ConsumerError;
use crate::id::MessageID;
use crate::shared::Shared;
use crate::state::ConsumerState;
use crate::wire::Response;
use crate::wire::Subscribe;

pub struct ConnectionManager {
    shared: Arc<Shared>,
    dispatcher: DispatcherHandle,
    frame_handler: Arc<dyn FrameHandler>,
}

impl ConnectionManager {
    pub fn new(
        shared: Arc<Shared>,
        dispatcher: DispatcherHandle,
        frame_handler: Arc<dyn FrameHandler>,
    ) -> ConnectionManager {
        ConnectionManager {
            shared,
            dispatcher,
            frame_handler,
        }
    }

    /// Resolve the partition's owning broker, subscribe, and register as its frame
    /// handler. Transitions `Initializing -> Ready` the first time this succeeds.
    pub async fn grab_conn(&self, context: &Context) -> Result<(), ConsumerError> {
        let resume_id = self.dispatcher.clear_for_reconnect().await;
        if let Some(id) = resume_id {
            *self.shared.start_message_id.lock().await = Some(id);
            *self.shared.start_message_id_inclusive.lock().await = true;
        }

        let addr = self
            .shared
            .lookup
            .lookup(&self.shared.config.topic)
            .await
            .map_err(ConsumerError::LookupFailed)?;
        let connection = self
            .shared
            .rpc
            .connect(&addr)
            .await
            .map_err(ConsumerError::LookupFailed)?;

        let start_message_id = if self.shared.durable() {
            None
        } else {
            *self.shared.start_message_id.lock().await
        };
        let inclusive = *self.shared.start_message_id_inclusive.lock().await;

        let subscribe = Subscribe {
            topic: self.shared.config.topic.clone(),
            subscription: self.shared.config.subscription.clone(),
            subscription_type: self.shared.config.subscription_type,
            consumer_id: self.shared.consumer_id,
            request_id: self.shared.rpc.new_request_id(),
            durable: self.shared.durable(),
            start_message_id,
            start_message_id_inclusive: inclusive,
            initial_position: self.shared.config.initial_position,
            metadata: self.shared.config.metadata.clone(),
            replicate_subscription_state: self.shared.config.replicate_subscription_state,
            read_compacted: self.shared.config.read_compacted,
            force_topic_creation: !self.shared.config.disable_force_topic_creation,
        };
        let request_id = subscribe.request_id;
        let response = self
            .shared
            .rpc
            .request(&addr, request_id, OutboundCommand::Subscribe(subscribe))
            .await
            .map_err(ConsumerError::SubscribeFailed)?;

        match response {
            Response::Success(_) => {
                connection
                    .add_consume_handler(self.shared.consumer_id, self.frame_handler.clone())
                    .await;
                *self.shared.connection.lock().await = Some(connection);
                self.shared
                    .state
                    .compare_transition(ConsumerState::Initializing, ConsumerState::Ready);
                self.dispatcher.connected().await;
                slog::info!(context.logger, "Subscribed to partition";
                    "topic" => &self.shared.config.topic, "partition" => self.shared.config.partition_index);
                Ok(())
            }
            Response::Error(error) => Err(ConsumerError::BrokerError {
                code: error.code,
                message: error.message,
            }),
            Response::LastMessageId(_) => Err(ConsumerError::UnexpectedMessage),
        }
    }

    /// Retry [`grab_conn`] with backoff until it succeeds or the consumer is no longer
    /// `Ready` (driven by a `connectionClosed` notification, `spec.md` §4.1).
    pub async fn reconnect_to_broker(
        &self,
        context: &Context,
        backoff: &mut crate::backoff::Backoff,
    ) {
        loop {
            if self.shared.state.load() != ConsumerState::Ready {
                return;
            }
            crate::telemetry::RECONNECT_COUNT.inc();
            match self.grab_conn(context).await {
                Ok(()) => {
                    backoff.success();
                    return;
                }
                Err(error) => {
                    if let Err(exhausted) = backoff.retry(context, error.into()).await {
                        slog::error!(context.logger, "Giving up on broker reconnection";
                            "error" => %exhausted);
                        return;
                    }
                }
            }
        }
    }

    /// Resolve the partition's current last message id ahead of any subscribe, using
    /// the connection-less `request` form since no broker connection exists yet.
    pub async fn get_last_message_id_initial(
        &self,
        context: &Context,
    ) -> Result<MessageID, ConsumerError> {
        let addr = self
            .shared
            .lookup
            .lookup(&self.shared.config.topic)
            .await
            .map_err(ConsumerError::LookupFailed)?;
        let request_id = self.shared.rpc.new_request_id();
        let response = self
            .shared
            .rpc
            .request(
                &addr,
                request_id,
                OutboundCommand::GetLastMessageId(crate::wire::GetLastMessageId {
                    request_id,
                    consumer_id: self.shared.consumer_id,
                }),
            )
            .await
            .map_err(ConsumerError::ControlRpcFailed)?;
        match response {
            Response::LastMessageId(resp) => Ok(resp.last_message_id),
            Response::Error(error) => {
                slog::debug!(context.logger, "GetLastMessageId failed during start-position refinement";
                    "error" => %error.message);
                Err(ConsumerError::BrokerError {
                    code: error.code,
                    message: error.message,
                })
            }
            Response::Success(_) => Err(ConsumerError::UnexpectedMessage),
        }
    }

    /// `spec.md` §4.1 start-message-id refinement, run once during construction before
    /// the dispatcher is started: if the caller asked for an inclusive `Latest` start,
    /// resolve it to a concrete id via `GetLastMessageId` so reconnects have a stable
    /// anchor. Does not clear any queues, since nothing has been delivered yet.
    pub async fn refine_initial_start_position(
        &self,
        last_message_id: Option<MessageID>,
    ) {
        let requested = self.shared.config.start_message_id;
        let is_latest_inclusive = matches!(
            requested,
            Some(ref start) if start.inclusive
        ) && matches!(
            self.shared.config.initial_position,
            crate::config::InitialPosition::Latest
        );
        if !is_latest_inclusive {
            return;
        }
        if let Some(id) = last_message_id {
            *self.shared.start_message_id.lock().await = Some(id);
            *self.shared.start_message_id_inclusive.lock().await = true;
        }
    }
}
