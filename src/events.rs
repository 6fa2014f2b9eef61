//! The event loop (C2): a single owner thread serialising every control operation onto
//! one mailbox, plus a sibling subtask watching for broker disconnects (`spec.md` §4.2).
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::backoff::Backoff;
use crate::collaborators::OutboundCommand;
use crate::connection::ConnectionManager;
use crate::context::Context;
use crate::dispatch::DispatcherHandle;
use crate::error::ConsumerError;
use crate::id::MessageID;
use crate::shared::Shared;
use crate::state::ConsumerState;
use crate::wire::Response;
use crate::wire::Seek;
use crate::wire::SeekTarget;

/// The tagged request bus described in `spec.md` §9: a sum type over every control
/// operation, each carrying a completion signal.
pub enum EventRequest {
    Ack {
        id: MessageID,
        reply: oneshot::Sender<()>,
    },
    Redeliver {
        ids: Vec<MessageID>,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    GetLastMessageId {
        reply: oneshot::Sender<Result<MessageID, ConsumerError>>,
    },
    Seek {
        id: MessageID,
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    SeekByTime {
        publish_time_ms: i64,
        reply: oneshot::Sender<Result<(), ConsumerError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle used by the consumer facade to enqueue requests onto a running
/// [`EventsActor`].
#[derive(Clone)]
pub struct EventsHandle {
    tx: mpsc::Sender<EventRequest>,
}

impl EventsHandle {
    pub async fn ack(&self, id: MessageID) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EventRequest::Ack { id, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn redeliver(&self, ids: Vec<MessageID>) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(EventRequest::Redeliver { ids, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn unsubscribe(&self) -> Result<(), ConsumerError> {
        self.roundtrip(|reply| EventRequest::Unsubscribe { reply })
            .await
    }

    pub async fn get_last_message_id(&self) -> Result<MessageID, ConsumerError> {
        self.roundtrip(|reply| EventRequest::GetLastMessageId { reply })
            .await
    }

    pub async fn seek(&self, id: MessageID) -> Result<(), ConsumerError> {
        self.roundtrip(|reply| EventRequest::Seek { id, reply })
            .await
    }

    pub async fn seek_by_time(&self, publish_time_ms: i64) -> Result<(), ConsumerError> {
        self.roundtrip(|reply| EventRequest::SeekByTime {
            publish_time_ms,
            reply,
        })
        .await
    }

    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EventRequest::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn roundtrip<T, F>(&self, build: F) -> Result<T, ConsumerError>
    where
        F: FnOnce(oneshot::Sender<Result<T, ConsumerError>>) -> EventRequest,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ConsumerError::Closing)?;
        rx.await.map_err(|_| ConsumerError::Closing)?
    }
}

/// Notifies the reconnect watcher that the current broker connection has dropped.
pub fn reconnect_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

pub struct EventsActor {
    shared: Arc<Shared>,
    requests: mpsc::Receiver<EventRequest>,
    dispatcher: DispatcherHandle,
    /// Tells the sibling [`reconnect_watcher`] task to stop, including mid-backoff, so
    /// `Close` is never stuck behind an unlimited `maxReconnectToBroker` loop.
    reconnect_shutdown: watch::Sender<bool>,
}

/// Allocate the request channel for an [`EventsActor`] before it is spawned, so its
/// [`EventsHandle`] can be handed to collaborators (e.g. [`crate::id::AckHandle`]
/// forwarders) that are constructed ahead of the actor itself.
pub fn channel() -> (EventsHandle, mpsc::Receiver<EventRequest>) {
    let (tx, rx) = mpsc::channel(64);
    (EventsHandle { tx }, rx)
}

/// Spawn the actor side of a channel obtained from [`channel`], plus its sibling
/// reconnect-watcher task (`spec.md` §4.2/§9: "ReconnectActor, a sibling of EventsActor
/// listening only on the connection-closed signal and back-off timers"). The two run as
/// separate `tokio::spawn`ed tasks so a long-running backoff loop in the watcher never
/// blocks `Ack`/`Seek`/`Unsubscribe`/`Close` from being serviced by the mailbox loop.
pub fn spawn(
    shared: Arc<Shared>,
    connection_manager: ConnectionManager,
    dispatcher: DispatcherHandle,
    connection_closed: mpsc::Receiver<()>,
    requests: mpsc::Receiver<EventRequest>,
    context: Context,
) {
    let (reconnect_shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(reconnect_watcher(
        shared.clone(),
        connection_manager,
        connection_closed,
        shutdown_rx,
        context.clone(),
    ));

    let actor = EventsActor {
        shared,
        requests,
        dispatcher,
        reconnect_shutdown,
    };
    tokio::spawn(actor.run(context));
}

/// The sibling reconnect-watcher task: waits for a `connectionClosed` notification, then
/// runs `reconnectToBroker` with backoff, racing it against `reconnect_shutdown` so a
/// `Close` mid-backoff abandons the attempt immediately instead of waiting it out.
async fn reconnect_watcher(
    shared: Arc<Shared>,
    connection_manager: ConnectionManager,
    mut connection_closed: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
    context: Context,
) {
    let mut backoff = Backoff::new(&shared.config.backoff);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            signal = connection_closed.recv() => {
                match signal {
                    Some(()) => {
                        tokio::select! {
                            _ = connection_manager.reconnect_to_broker(&context, &mut backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

impl EventsActor {
    async fn run(mut self, context: Context) {
        while let Some(request) = self.requests.recv().await {
            let should_exit = matches!(&request, EventRequest::Close { .. });
            self.handle(&context, request).await;
            if should_exit {
                break;
            }
        }
    }

    async fn handle(&mut self, context: &Context, request: EventRequest) {
        match request {
            EventRequest::Ack { id, reply } => {
                self.send_no_wait(crate::wire::Ack {
                    consumer_id: self.shared.consumer_id,
                    message_ids: vec![id],
                    validation_error: None,
                })
                .await;
                let _ = reply.send(());
            }
            EventRequest::Redeliver { ids, reply } => {
                self.send_no_wait(crate::wire::RedeliverUnacknowledged {
                    consumer_id: self.shared.consumer_id,
                    message_ids: ids,
                })
                .await;
                let _ = reply.send(());
            }
            EventRequest::Unsubscribe { reply } => {
                let result = self.unsubscribe(context).await;
                let _ = reply.send(result);
            }
            EventRequest::GetLastMessageId { reply } => {
                let result = self.get_last_message_id().await;
                let _ = reply.send(result);
            }
            EventRequest::Seek { id, reply } => {
                let result = self.seek(SeekTarget::MessageId(id)).await;
                let _ = reply.send(result);
            }
            EventRequest::SeekByTime {
                publish_time_ms,
                reply,
            } => {
                let result = self.seek(SeekTarget::PublishTimeMs(publish_time_ms)).await;
                let _ = reply.send(result);
            }
            EventRequest::Close { reply } => {
                self.close(context).await;
                let _ = reply.send(());
            }
        }
    }

    async fn current_connection(&self) -> Option<Arc<dyn crate::collaborators::Connection>> {
        self.shared.connection.lock().await.clone()
    }

    async fn send_no_wait(&self, command: impl Into<OutboundCommand>) {
        if let Some(conn) = self.current_connection().await {
            self.shared
                .rpc
                .request_on_cnx_no_wait(conn.id(), command.into())
                .await;
        }
    }

    async fn request_on_cnx(&self, command: OutboundCommand) -> Result<Response, ConsumerError> {
        let conn = self
            .current_connection()
            .await
            .ok_or(ConsumerError::Closing)?;
        let request_id = self.shared.rpc.new_request_id();
        self.shared
            .rpc
            .request_on_cnx(conn.id(), request_id, command)
            .await
            .map_err(ConsumerError::ControlRpcFailed)
    }

    async fn unsubscribe(&mut self, context: &Context) -> Result<(), ConsumerError> {
        if self.shared.state.is_closing_or_closed() {
            return Ok(());
        }
        if !self
            .shared
            .state
            .compare_transition(ConsumerState::Ready, ConsumerState::Closing)
        {
            return Ok(());
        }
        let request_id = self.shared.rpc.new_request_id();
        let response = self
            .request_on_cnx(OutboundCommand::Unsubscribe(crate::wire::Unsubscribe {
                request_id,
                consumer_id: self.shared.consumer_id,
            }))
            .await;
        match response {
            Ok(Response::Success(_)) => {
                if let Some(conn) = self.current_connection().await {
                    conn.delete_consume_handler(self.shared.consumer_id).await;
                }
                self.shared.state.store(ConsumerState::Closed);
                Ok(())
            }
            Ok(Response::Error(error)) => {
                self.shared.state.store(ConsumerState::Ready);
                Err(ConsumerError::BrokerError {
                    code: error.code,
                    message: error.message,
                })
            }
            Ok(Response::LastMessageId(_)) => {
                self.shared.state.store(ConsumerState::Ready);
                Err(ConsumerError::UnexpectedMessage)
            }
            Err(error) => {
                self.shared.state.store(ConsumerState::Ready);
                slog::warn!(context.logger, "Unsubscribe RPC failed, state rolled back to Ready";
                    "error" => %error);
                Err(error)
            }
        }
    }

    async fn get_last_message_id(&self) -> Result<MessageID, ConsumerError> {
        if self.shared.state.is_closing_or_closed() {
            return Err(ConsumerError::Closing);
        }
        let request_id = self.shared.rpc.new_request_id();
        let response = self
            .request_on_cnx(OutboundCommand::GetLastMessageId(
                crate::wire::GetLastMessageId {
                    request_id,
                    consumer_id: self.shared.consumer_id,
                },
            ))
            .await?;
        match response {
            Response::LastMessageId(resp) => Ok(resp.last_message_id),
            Response::Error(error) => Err(ConsumerError::BrokerError {
                code: error.code,
                message: error.message,
            }),
            Response::Success(_) => Err(ConsumerError::UnexpectedMessage),
        }
    }

    async fn seek(&self, target: SeekTarget) -> Result<(), ConsumerError> {
        if self.shared.state.is_closing_or_closed() {
            return Err(ConsumerError::Closing);
        }
        let request_id = self.shared.rpc.new_request_id();
        let response = self
            .request_on_cnx(OutboundCommand::Seek(Seek {
                consumer_id: self.shared.consumer_id,
                request_id,
                target,
            }))
            .await?;
        match response {
            Response::Success(_) => {
                if let SeekTarget::MessageId(id) = target {
                    *self.shared.start_message_id.lock().await = Some(id);
                    *self.shared.start_message_id_inclusive.lock().await = true;
                }
                self.dispatcher.clear_for_seek().await;
                Ok(())
            }
            Response::Error(error) => Err(ConsumerError::BrokerError {
                code: error.code,
                message: error.message,
            }),
            Response::LastMessageId(_) => Err(ConsumerError::UnexpectedMessage),
        }
    }

    async fn close(&mut self, context: &Context) {
        if self.shared.state.is_closing_or_closed() {
            return;
        }
        self.shared.state.store(ConsumerState::Closing);
        // Interrupt the sibling reconnect watcher immediately, even mid-backoff, rather
        // than waiting for it to next check `state` between attempts.
        let _ = self.reconnect_shutdown.send(true);
        let request_id = self.shared.rpc.new_request_id();
        let response = self
            .request_on_cnx(OutboundCommand::CloseConsumer(
                crate::wire::CloseConsumer {
                    request_id,
                    consumer_id: self.shared.consumer_id,
                },
            ))
            .await;
        if let Err(error) = response {
            slog::warn!(context.logger, "CloseConsumer RPC failed, closing best-effort";
                "error" => %error);
        }
        self.shared.compression.close_all().await;
        self.shared.state.store(ConsumerState::Closed);
        if let Some(conn) = self.current_connection().await {
            conn.delete_consume_handler(self.shared.consumer_id).await;
        }
        self.shared.nack_tracker.close().await;
        self.dispatcher.close().await;
    }
}
