//! In-memory fixture collaborators for tests, following the shape of
//! `core/tasks/src/execute/fixture.rs` (a concrete backend behind a thin async trait,
//! introspectable by the test that owns it).
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::collaborators::BrokerAddress;
use crate::collaborators::CompressionProvider;
use crate::collaborators::CompressionProviderFactory;
use crate::collaborators::Connection;
use crate::collaborators::ConnectionId;
use crate::collaborators::ConsumerInterceptors;
use crate::collaborators::DlqRouter;
use crate::collaborators::FrameHandler;
use crate::collaborators::LookupService;
use crate::collaborators::NackTracker;
use crate::collaborators::OutboundCommand;
use crate::id::MessageID;
use crate::message::Message;
use crate::wire::GetLastMessageIdResponse;
use crate::wire::Response;
use crate::wire::Success;

/// Resolves every topic to the same fixed broker address.
pub struct FixtureLookup;

#[async_trait]
impl LookupService for FixtureLookup {
    async fn lookup(&self, _topic: &str) -> anyhow::Result<BrokerAddress> {
        Ok(BrokerAddress {
            logical: "broker-fixture".into(),
            physical: "broker-fixture".into(),
        })
    }
}

/// A single fake broker connection. Holds the frame handler registered by the
/// connection manager so a test can push inbound frames directly.
pub struct FixtureConnection {
    id: ConnectionId,
    handlers: Mutex<HashMap<u64, Arc<dyn FrameHandler>>>,
}

impl FixtureConnection {
    fn new(id: ConnectionId) -> FixtureConnection {
        FixtureConnection {
            id,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Push an inbound frame to the handler registered for `consumer_id`, as the real
    /// connection layer would once it decoded a frame addressed to it.
    pub async fn deliver(&self, consumer_id: u64, frame: crate::wire::InboundMessage) {
        let handler = self.handlers.lock().await.get(&consumer_id).cloned();
        if let Some(handler) = handler {
            handler.message_received(frame).await;
        }
    }

    /// Simulate the broker dropping this connection.
    pub async fn close(&self, consumer_id: u64) {
        let handler = self.handlers.lock().await.get(&consumer_id).cloned();
        if let Some(handler) = handler {
            handler.connection_closed().await;
        }
    }
}

#[async_trait]
impl Connection for FixtureConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn add_consume_handler(&self, consumer_id: u64, handler: Arc<dyn FrameHandler>) {
        self.handlers.lock().await.insert(consumer_id, handler);
    }

    async fn delete_consume_handler(&self, consumer_id: u64) {
        self.handlers.lock().await.remove(&consumer_id);
    }
}

/// Records every command sent through it and answers requests with canned responses,
/// following the introspection style of `ReceivedTaskFixture`.
pub struct FixtureRpc {
    connection: Arc<FixtureConnection>,
    sent: Mutex<Vec<OutboundCommand>>,
    next_consumer_id: AtomicU64,
    next_request_id: AtomicU64,
    last_message_id: Mutex<MessageID>,
    errors: Mutex<VecDeque<anyhow::Error>>,
}

impl FixtureRpc {
    pub fn new() -> FixtureRpc {
        FixtureRpc {
            connection: Arc::new(FixtureConnection::new(1)),
            sent: Mutex::new(Vec::new()),
            next_consumer_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            last_message_id: Mutex::new(MessageID::no_entry(0)),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn connection(&self) -> Arc<FixtureConnection> {
        self.connection.clone()
    }

    /// Set the id returned by the next `GetLastMessageId` response.
    pub async fn set_last_message_id(&self, id: MessageID) {
        *self.last_message_id.lock().await = id;
    }

    /// Queue a transport-level failure for the next `request`/`request_on_cnx` call.
    pub async fn fail_next(&self, error: anyhow::Error) {
        self.errors.lock().await.push_back(error);
    }

    /// Every command sent so far, in order, across all three `request*` methods.
    pub async fn sent(&self) -> Vec<OutboundCommand> {
        self.sent.lock().await.clone()
    }

    async fn answer(&self, command: OutboundCommand) -> anyhow::Result<Response> {
        self.sent.lock().await.push(command.clone());
        if let Some(error) = self.errors.lock().await.pop_front() {
            return Err(error);
        }
        let response = match command {
            OutboundCommand::Subscribe(cmd) => Response::Success(Success {
                request_id: cmd.request_id,
            }),
            OutboundCommand::Seek(cmd) => Response::Success(Success {
                request_id: cmd.request_id,
            }),
            OutboundCommand::Unsubscribe(cmd) => Response::Success(Success {
                request_id: cmd.request_id,
            }),
            OutboundCommand::CloseConsumer(cmd) => Response::Success(Success {
                request_id: cmd.request_id,
            }),
            OutboundCommand::GetLastMessageId(cmd) => {
                let last_message_id = *self.last_message_id.lock().await;
                Response::LastMessageId(GetLastMessageIdResponse {
                    request_id: cmd.request_id,
                    last_message_id,
                })
            }
            OutboundCommand::Flow(_)
            | OutboundCommand::Ack(_)
            | OutboundCommand::RedeliverUnacknowledged(_) => Response::Success(Success {
                request_id: 0,
            }),
        };
        Ok(response)
    }
}

#[async_trait]
impl crate::collaborators::RpcClient for FixtureRpc {
    fn new_consumer_id(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn new_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn connect(&self, _addr: &BrokerAddress) -> anyhow::Result<Arc<dyn Connection>> {
        Ok(self.connection.clone())
    }

    async fn request(
        &self,
        _addr: &BrokerAddress,
        _request_id: u64,
        command: OutboundCommand,
    ) -> anyhow::Result<Response> {
        self.answer(command).await
    }

    async fn request_on_cnx(
        &self,
        _connection: ConnectionId,
        _request_id: u64,
        command: OutboundCommand,
    ) -> anyhow::Result<Response> {
        self.answer(command).await
    }

    async fn request_on_cnx_no_wait(&self, _connection: ConnectionId, command: OutboundCommand) {
        self.sent.lock().await.push(command);
    }
}

/// Decompresses nothing -- returns the payload unchanged. Good enough for tests, which
/// never exercise a real codec (`spec.md` §1 excludes the wire-level compression codec).
pub struct PassthroughCompressionProvider;

#[async_trait]
impl CompressionProvider for PassthroughCompressionProvider {
    fn decompress(&self, src: &[u8], _uncompressed_size: u32) -> anyhow::Result<Vec<u8>> {
        Ok(src.to_vec())
    }

    async fn close(&self) {}
}

pub struct FixtureCompressionFactory;

impl CompressionProviderFactory for FixtureCompressionFactory {
    fn provider_for(&self, _compression: crate::wire::CompressionType) -> Box<dyn CompressionProvider> {
        Box::new(PassthroughCompressionProvider)
    }
}

/// Never diverts to the dead-letter queue.
pub struct FixtureDlq;

#[async_trait]
impl DlqRouter for FixtureDlq {
    fn should_send_to_dlq(&self, _message: &Message) -> bool {
        false
    }

    async fn send(&self, _message: Message) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records nacked ids for inspection; never actually schedules redelivery.
pub struct FixtureNackTracker {
    added: Mutex<Vec<MessageID>>,
}

impl FixtureNackTracker {
    pub fn new() -> FixtureNackTracker {
        FixtureNackTracker {
            added: Mutex::new(Vec::new()),
        }
    }

    pub async fn added(&self) -> Vec<MessageID> {
        self.added.lock().await.clone()
    }
}

#[async_trait]
impl NackTracker for FixtureNackTracker {
    async fn add(&self, id: MessageID) {
        self.added.lock().await.push(id);
    }

    async fn close(&self) {}
}

/// Passes messages and ids through unchanged.
pub struct FixtureInterceptors;

#[async_trait]
impl ConsumerInterceptors for FixtureInterceptors {
    async fn before_consume(&self, message: Message) -> Message {
        message
    }

    async fn on_acknowledge(&self, _id: MessageID) {}

    async fn on_negative_acks_send(&self, _ids: &[MessageID]) {}
}
