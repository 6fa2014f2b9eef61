//! The dispatcher (C4): sole owner of `availablePermits`, the sole writer to the
//! application and DLQ channels, and the sole issuer of `Flow` RPCs during steady state.
//!
//! Colocating these three responsibilities in one actor is what makes permit accounting
//! race-free without locks (`spec.md` §4.4). The application-facing "channel" is not a
//! `tokio::sync::mpsc` pair handed out to the caller: it is a `VecDeque` owned by this
//! actor, drained by `Pull` requests routed through the same mailbox as every other
//! control request. This is what lets `ClearForSeek` actually empty it (`spec.md` §4.4
//! point 5) -- a plain `mpsc::Sender` can never be drained from the sending side.
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::collaborators::OutboundCommand;
use crate::id::MessageID;
use crate::message::Message;
use crate::shared::Shared;

/// Control requests the dispatcher accepts from [`crate::events::EventsActor`],
/// [`crate::connection::ConnectionManager`], and the application-facing
/// [`ApplicationReceiver`].
pub enum DispatchRequest {
    /// A fresh broker session is up; drop the stale batch and reset permits.
    Connected,
    /// Drain the prefetch queue for a reconnect; reply with the id to resume from.
    ClearForReconnect {
        reply: oneshot::Sender<Option<MessageID>>,
    },
    /// Drain both queues for a seek; reply once draining and permit reset complete.
    ClearForSeek { reply: oneshot::Sender<()> },
    /// The application wants the next delivered message, waiting if none is ready yet.
    Pull { reply: oneshot::Sender<Option<Message>> },
    /// Stop the loop.
    Close,
}

/// Handle used by other actors to talk to a running [`DispatcherActor`].
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchRequest>,
}

impl DispatcherHandle {
    pub async fn connected(&self) {
        let _ = self.tx.send(DispatchRequest::Connected).await;
    }

    /// Ask the dispatcher to drain its prefetch queue and report the resume point.
    pub async fn clear_for_reconnect(&self) -> Option<MessageID> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(DispatchRequest::ClearForReconnect { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn clear_for_seek(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(DispatchRequest::ClearForSeek { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub async fn close(&self) {
        let _ = self.tx.send(DispatchRequest::Close).await;
    }
}

/// The application's view of the dispatcher's delivered-message queue.
///
/// Shares the dispatcher's own mailbox rather than a separate `mpsc` pair: every `recv`
/// is a `Pull` request the dispatcher actor answers from the same `delivered` buffer it
/// drains on `ClearForSeek`, so there is no second queue left stale by a seek.
#[derive(Clone)]
pub struct ApplicationReceiver {
    tx: mpsc::Sender<DispatchRequest>,
}

impl ApplicationReceiver {
    /// Wait for the next delivered message, or `None` once the dispatcher has stopped.
    pub async fn recv(&self) -> Option<Message> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchRequest::Pull { reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }
}

/// A batch handed from the receive pipeline to the dispatcher, preserving intra-batch
/// delivery order.
pub type PrefetchBatch = Vec<Message>;

pub struct DispatcherActor {
    shared: Arc<Shared>,
    requests: mpsc::Receiver<DispatchRequest>,
    prefetch: mpsc::Receiver<PrefetchBatch>,
    /// Messages already delivered to the application but not yet pulled. Bounded by
    /// `receiver_queue_size`, same as `current`'s budget against the broker.
    delivered: VecDeque<Message>,
    /// `Pull` requests waiting on a message that hasn't arrived yet.
    pending_pulls: VecDeque<oneshot::Sender<Option<Message>>>,
    available_permits: u32,
    current: VecDeque<Message>,
}

/// Spawn a [`DispatcherActor`] and return the handle used to control it, the receiver
/// the application pulls delivered messages from, and the prefetch sender the receive
/// pipeline pushes batches to.
pub fn spawn(
    shared: Arc<Shared>,
    context: crate::context::Context,
) -> (DispatcherHandle, ApplicationReceiver, mpsc::Sender<PrefetchBatch>) {
    let (requests_tx, requests_rx) = mpsc::channel(64);
    let (prefetch_tx, prefetch_rx) = mpsc::channel(shared.config.receiver_queue_size.max(1));
    let actor = DispatcherActor {
        shared,
        requests: requests_rx,
        prefetch: prefetch_rx,
        delivered: VecDeque::new(),
        pending_pulls: VecDeque::new(),
        available_permits: 0,
        current: VecDeque::new(),
    };
    tokio::spawn(actor.run(context));
    (
        DispatcherHandle { tx: requests_tx.clone() },
        ApplicationReceiver { tx: requests_tx },
        prefetch_tx,
    )
}

impl DispatcherActor {
    async fn run(mut self, context: crate::context::Context) {
        loop {
            // Whether the head of `current` is destined for the DLQ or the application
            // channel, computed up front so the select below can gate each delivery arm
            // on the right target being writable without borrowing `self` inside the
            // `tokio::select!` macro's branch conditions.
            let head_to_dlq = self
                .current
                .front()
                .map(|message| self.shared.dlq.should_send_to_dlq(message));
            let app_writable = self.delivered.len() < self.shared.config.receiver_queue_size.max(1);

            tokio::select! {
                batch = self.prefetch.recv(), if self.current.is_empty() => {
                    match batch {
                        Some(batch) => self.current.extend(batch),
                        None => break,
                    }
                }
                // Only selected once the application buffer has room -- this is what
                // keeps the loop responsive to clear-for-reconnect/seek/close requests
                // while the application is slow to drain.
                _ = std::future::ready(()), if head_to_dlq == Some(false) && app_writable => {
                    let message = self.current.pop_front().expect("head_to_dlq checked above");
                    self.deliver_to_app(&context, message).await;
                }
                _ = std::future::ready(()), if head_to_dlq == Some(true) => {
                    let message = self.current.pop_front().expect("head_to_dlq checked above");
                    self.deliver_to_dlq(&context, message).await;
                }
                request = self.requests.recv() => {
                    match request {
                        Some(DispatchRequest::Connected) => {
                            self.current.clear();
                            self.available_permits = 0;
                            self.send_flow(&context, self.shared.config.receiver_queue_size as u32).await;
                        }
                        Some(DispatchRequest::ClearForReconnect { reply }) => {
                            let resume = self.clear_for_reconnect().await;
                            let _ = reply.send(resume);
                        }
                        Some(DispatchRequest::ClearForSeek { reply }) => {
                            self.clear_for_seek(&context).await;
                            let _ = reply.send(());
                        }
                        Some(DispatchRequest::Pull { reply }) => {
                            match self.delivered.pop_front() {
                                Some(message) => { let _ = reply.send(Some(message)); }
                                None => self.pending_pulls.push_back(reply),
                            }
                        }
                        Some(DispatchRequest::Close) | None => break,
                    }
                }
            }
        }
    }

    /// Hand `message` straight to a waiting `Pull`, or buffer it for the next one.
    async fn deliver_to_app(&mut self, context: &crate::context::Context, message: Message) {
        let id = message.id.id();
        match self.pending_pulls.pop_front() {
            Some(reply) => {
                let _ = reply.send(Some(message));
            }
            None => self.delivered.push_back(message),
        }
        crate::telemetry::DELIVERED_COUNT.inc();
        self.after_delivery(context, id).await;
    }

    async fn deliver_to_dlq(&mut self, context: &crate::context::Context, message: Message) {
        let id = message.id.id();
        if let Err(error) = self.shared.dlq.send(message).await {
            slog::warn!(context.logger, "Failed to divert message to dead-letter queue";
                "error" => %error);
        } else {
            crate::telemetry::DLQ_COUNT.inc();
        }
        self.after_delivery(context, id).await;
    }

    /// Bookkeeping common to both delivery targets: `lastDequeuedMsg`, the prefetch
    /// gauge, and permit accounting (`spec.md` §4.4).
    async fn after_delivery(&mut self, context: &crate::context::Context, id: MessageID) {
        *self.shared.last_dequeued_msg.lock().await = Some(id);
        crate::telemetry::PREFETCHED_MESSAGES.dec();

        self.available_permits += 1;
        let threshold = self.shared.config.flow_threshold() as u32;
        if self.available_permits >= threshold {
            let permits = self.available_permits;
            self.available_permits = 0;
            self.send_flow(context, permits).await;
        }
    }

    async fn send_flow(&self, context: &crate::context::Context, permits: u32) {
        if permits == 0 {
            return;
        }
        let conn = self.shared.connection.lock().await.clone();
        let conn = match conn {
            Some(conn) => conn,
            None => return,
        };
        let command = OutboundCommand::Flow(crate::wire::Flow {
            consumer_id: self.shared.consumer_id,
            message_permits: permits,
        });
        self.shared
            .rpc
            .request_on_cnx_no_wait(conn.id(), command)
            .await;
        crate::telemetry::FLOW_COUNT.inc();
        slog::debug!(context.logger, "Issued Flow permits"; "permits" => permits);
    }

    /// Drain the prefetch queue on reconnect, remembering the first undelivered id.
    ///
    /// Returns the id to resume from: the id just before the first unconsumed message,
    /// `last_dequeued_msg` if the queue was empty, or `None` if nothing was ever
    /// dequeued (caller falls back to the original configured start id).
    async fn clear_for_reconnect(&mut self) -> Option<MessageID> {
        // The first id still sitting in `current` (if any) is the first unconsumed
        // message; everything behind it in the prefetch queue is discarded too, so only
        // that one id matters for computing the resume point. Messages already handed to
        // `delivered` survived to the application and are left in place.
        let first_unconsumed = self.current.front().map(|message| message.id.id());
        while self.prefetch.try_recv().is_ok() {}
        self.current.clear();
        self.available_permits = 0;

        match first_unconsumed {
            Some(id) => Some(id.previous()),
            None => *self.shared.last_dequeued_msg.lock().await,
        }
    }

    /// Drain the prefetch queue *and* the application buffer, then reset permits ahead
    /// of a `Seek` (`spec.md` §4.4 point 5, §8 scenario 4: "After return, both channels
    /// are empty"). `pending_pulls` is left untouched: an application already waiting on
    /// `recv` with nothing buffered simply keeps waiting for the first post-seek message.
    async fn clear_for_seek(&mut self, context: &crate::context::Context) {
        self.current.clear();
        while self.prefetch.try_recv().is_ok() {}
        self.delivered.clear();
        self.available_permits = 0;
        self.send_flow(context, self.shared.config.receiver_queue_size as u32)
            .await;
    }
}
