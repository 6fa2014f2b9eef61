//! End-to-end scenarios driving a [`PartitionConsumer`] against the in-memory fixture
//! collaborators in `fixture.rs`, the same style as `core/tasks`'s `ReceivedTaskFixture`
//! based tests: push input through the fixture, then assert on what it recorded.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use replicore_partition_consumer::collaborators::OutboundCommand;
use replicore_partition_consumer::config::BackoffConfig;
use replicore_partition_consumer::config::ConsumerConfig;
use replicore_partition_consumer::config::CryptoFailureAction;
use replicore_partition_consumer::config::InitialPosition;
use replicore_partition_consumer::config::StartMessageId;
use replicore_partition_consumer::config::SubscriptionMode;
use replicore_partition_consumer::config::SubscriptionType;
use replicore_partition_consumer::consumer::Collaborators;
use replicore_partition_consumer::consumer::PartitionConsumer;
use replicore_partition_consumer::context::Context;
use replicore_partition_consumer::dispatch::ApplicationReceiver;
use replicore_partition_consumer::fixture::FixtureCompressionFactory;
use replicore_partition_consumer::fixture::FixtureDlq;
use replicore_partition_consumer::fixture::FixtureInterceptors;
use replicore_partition_consumer::fixture::FixtureLookup;
use replicore_partition_consumer::fixture::FixtureNackTracker;
use replicore_partition_consumer::fixture::FixtureRpc;
use replicore_partition_consumer::id::MessageID;
use replicore_partition_consumer::wire::CompressionType;
use replicore_partition_consumer::wire::InboundMessage;
use replicore_partition_consumer::wire::MessageMetadata;
use replicore_partition_consumer::wire::SingleMessageMetadata;

fn config(receiver_queue_size: usize) -> ConsumerConfig {
    ConsumerConfig {
        topic: "persistent://public/default/scenarios".into(),
        subscription: "scenarios-sub".into(),
        subscription_type: SubscriptionType::Exclusive,
        initial_position: InitialPosition::Latest,
        partition_index: 0,
        receiver_queue_size,
        nack_redelivery_delay: Duration::from_secs(60),
        metadata: HashMap::new(),
        replicate_subscription_state: false,
        start_message_id: None,
        subscription_mode: SubscriptionMode::NonDurable,
        read_compacted: false,
        disable_force_topic_creation: false,
        backoff: BackoffConfig::default(),
        crypto_failure_action: CryptoFailureAction::FailConsume,
    }
}

fn frame_metadata() -> MessageMetadata {
    MessageMetadata {
        num_messages_in_batch: None,
        compression: CompressionType::None,
        uncompressed_size: 0,
        encryption_keys: Vec::new(),
        encryption_algo: None,
        encryption_param: None,
        publish_time_ms: 0,
        event_time_ms: 0,
        partition_key: None,
        producer_name: "producer-1".into(),
        properties: HashMap::new(),
        replicate_to: Vec::new(),
        replicated_from: None,
    }
}

fn frame_with(metadata: MessageMetadata, id: MessageID, payload: Vec<u8>) -> InboundMessage {
    InboundMessage {
        message_id: id,
        redelivery_count: 0,
        metadata_bytes: serde_json::to_vec(&metadata).unwrap(),
        payload,
    }
}

fn frame(id: MessageID, num_in_batch: Option<i32>, payload: Vec<u8>) -> InboundMessage {
    frame_with(
        MessageMetadata {
            num_messages_in_batch: num_in_batch,
            ..frame_metadata()
        },
        id,
        payload,
    )
}

fn encode_entry(metadata: &SingleMessageMetadata, payload: &[u8]) -> Vec<u8> {
    let meta_bytes = serde_json::to_vec(metadata).unwrap();
    let mut out = Vec::new();
    out.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&meta_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Spawn a consumer wired to fresh fixture collaborators. Returns the consumer, the
/// application channel, the [`FixtureRpc`] (for introspection) and the consumer id the
/// broker-side fixture frames must be addressed to.
async fn spawn(conf: ConsumerConfig) -> (
    PartitionConsumer,
    ApplicationReceiver,
    Arc<FixtureRpc>,
    u64,
) {
    let rpc = Arc::new(FixtureRpc::new());
    let collaborators = Collaborators {
        lookup: Arc::new(FixtureLookup),
        rpc: rpc.clone(),
        crypto: None,
        compression: Arc::new(FixtureCompressionFactory),
        dlq: Arc::new(FixtureDlq),
        nack_tracker: Arc::new(FixtureNackTracker::new()),
        interceptors: Arc::new(FixtureInterceptors),
    };
    let context = Context::fixture();
    let (consumer, app_rx) = PartitionConsumer::spawn(&context, conf, collaborators)
        .await
        .expect("consumer should subscribe against the fixture broker");
    // The fixture allocates consumer ids starting at 1; exactly one consumer is spawned
    // per `rpc` instance in these tests, so this is always the id the broker frames need.
    (consumer, app_rx, rpc, 1)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn delivers_in_order_and_resets_permits_at_threshold() {
    let (_consumer, app_rx, rpc, consumer_id) = spawn(config(4)).await;
    let connection = rpc.connection();

    connection
        .deliver(consumer_id, frame(MessageID::new(1, 0, 0), None, b"m0".to_vec()))
        .await;
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 1, 0), None, b"m1".to_vec()))
        .await;

    let first = app_rx.recv().await.expect("first message delivered");
    let second = app_rx.recv().await.expect("second message delivered");
    assert_eq!(first.payload, b"m0");
    assert_eq!(second.payload, b"m1");
    settle().await;

    let sent = rpc.sent().await;
    let flows: Vec<u32> = sent
        .iter()
        .filter_map(|cmd| match cmd {
            OutboundCommand::Flow(flow) => Some(flow.message_permits),
            _ => None,
        })
        .collect();
    // The initial `Connected` flow grants the full queue size (4); once two deliveries
    // cross the threshold (flow_threshold(4) == 2) a second flow resets the counter.
    assert_eq!(flows, vec![4, 2]);
}

#[tokio::test]
async fn batched_ack_coalesces_into_one_broker_ack() {
    let (_consumer, app_rx, rpc, consumer_id) = spawn(config(8)).await;
    let connection = rpc.connection();

    let mut payload = Vec::new();
    for i in 0..3u8 {
        payload.extend(encode_entry(&SingleMessageMetadata::default(), &[i]));
    }
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 7, 0), Some(3), payload))
        .await;

    let m0 = app_rx.recv().await.unwrap();
    let m1 = app_rx.recv().await.unwrap();
    let m2 = app_rx.recv().await.unwrap();
    assert_eq!(m0.id.id().batch_index, 0);
    assert_eq!(m1.id.id().batch_index, 1);
    assert_eq!(m2.id.id().batch_index, 2);

    m0.id.ack().await;
    m2.id.ack().await;
    settle().await;
    assert!(
        !rpc.sent().await.iter().any(|cmd| matches!(cmd, OutboundCommand::Ack(_))),
        "no broker ack until every batch index has acked"
    );

    m1.id.ack().await;
    settle().await;
    let acks: Vec<_> = rpc
        .sent()
        .await
        .into_iter()
        .filter_map(|cmd| match cmd {
            OutboundCommand::Ack(ack) => Some(ack),
            _ => None,
        })
        .collect();
    assert_eq!(acks.len(), 1, "exactly one coalesced ack reaches the broker");
    let acked_id = acks[0].message_ids[0];
    assert_eq!((acked_id.ledger_id, acked_id.entry_id), (1, 7));
}

#[tokio::test]
async fn start_position_filtering_discards_up_to_the_cursor() {
    let mut conf = config(4);
    conf.initial_position = InitialPosition::Earliest;
    conf.start_message_id = Some(StartMessageId {
        id: MessageID::new(1, 5, 0),
        inclusive: false,
    });
    let (_consumer, app_rx, rpc, consumer_id) = spawn(conf).await;
    let connection = rpc.connection();

    connection
        .deliver(consumer_id, frame(MessageID::new(1, 4, 0), None, b"discarded-4".to_vec()))
        .await;
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 5, 0), None, b"discarded-5".to_vec()))
        .await;
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 6, 0), None, b"kept-6".to_vec()))
        .await;
    settle().await;

    let kept = app_rx.recv().await.expect("only the surviving message is delivered");
    assert_eq!(kept.payload, b"kept-6");
    assert!(
        tokio::time::timeout(Duration::from_millis(50), app_rx.recv())
            .await
            .is_err(),
        "discarded messages never reach the application channel"
    );

    let acked_entries: Vec<i64> = rpc
        .sent()
        .await
        .into_iter()
        .filter_map(|cmd| match cmd {
            OutboundCommand::Ack(ack) => Some(ack.message_ids[0].entry_id),
            _ => None,
        })
        .collect();
    assert_eq!(acked_entries, vec![4, 5]);
}

#[tokio::test]
async fn seek_drains_queued_backlog() {
    // Queue size 2: a 3-entry batch fills the application buffer with two delivered
    // messages and leaves the third queued inside the dispatcher, undelivered.
    let (consumer, app_rx, rpc, consumer_id) = spawn(config(2)).await;
    let connection = rpc.connection();

    let mut payload = Vec::new();
    for i in 0..3u8 {
        payload.extend(encode_entry(&SingleMessageMetadata::default(), &[i]));
    }
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 10, 0), Some(3), payload))
        .await;
    settle().await;

    consumer
        .seek(MessageID::new(2, 0, 0))
        .await
        .expect("seek against the fixture broker succeeds");
    settle().await;

    // Both the prefetch queue and the application buffer are empty once seek returns:
    // none of the three pre-seek entries are ever delivered.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), app_rx.recv())
            .await
            .is_err(),
        "the application channel is empty immediately after seek returns"
    );

    connection
        .deliver(consumer_id, frame(MessageID::new(2, 1, 0), None, b"after-seek".to_vec()))
        .await;
    let fresh = app_rx.recv().await.expect("post-seek message delivered normally");
    assert_eq!(fresh.payload, b"after-seek");

    let sent = rpc.sent().await;
    let seek_index = sent
        .iter()
        .position(|cmd| matches!(cmd, OutboundCommand::Seek(_)))
        .expect("a Seek command was sent");
    assert!(
        sent[seek_index + 1..]
            .iter()
            .any(|cmd| matches!(cmd, OutboundCommand::Flow(flow) if flow.message_permits == 2)),
        "clearing for seek re-issues the initial flow"
    );
}

#[tokio::test]
async fn reconnect_resumes_from_the_first_undelivered_entry() {
    // Queue size 2: the batch's third entry stays in the dispatcher, undelivered, when
    // the connection drops -- that is the id reconnection must resume from.
    let (_consumer, _app_rx, rpc, consumer_id) = spawn(config(2)).await;
    let connection = rpc.connection();

    let mut payload = Vec::new();
    for i in 0..3u8 {
        payload.extend(encode_entry(&SingleMessageMetadata::default(), &[i]));
    }
    connection
        .deliver(consumer_id, frame(MessageID::new(1, 10, 0), Some(3), payload))
        .await;
    // Left undrained on purpose: the first two entries fill the (size-2) application
    // channel and the third stays queued inside the dispatcher, never delivered.
    settle().await;

    connection.close(consumer_id).await;
    settle().await;

    let resubscribes: Vec<_> = rpc
        .sent()
        .await
        .into_iter()
        .filter_map(|cmd| match cmd {
            OutboundCommand::Subscribe(sub) => Some(sub),
            _ => None,
        })
        .collect();
    assert_eq!(resubscribes.len(), 2, "the initial subscribe plus one on reconnect");
    let resume = resubscribes[1]
        .start_message_id
        .expect("reconnect carries an explicit resume id");
    assert_eq!((resume.ledger_id, resume.entry_id, resume.batch_index), (1, 10, 1));
    assert!(resubscribes[1].start_message_id_inclusive);
}

#[tokio::test]
async fn undecryptable_message_is_delivered_under_consume_policy() {
    let mut conf = config(4);
    conf.crypto_failure_action = CryptoFailureAction::Consume;
    let (_consumer, app_rx, rpc, consumer_id) = spawn(conf).await;
    let connection = rpc.connection();

    let encrypted = frame_with(
        MessageMetadata {
            encryption_keys: vec!["missing-key".into()],
            ..frame_metadata()
        },
        MessageID::new(1, 0, 0),
        b"ciphertext".to_vec(),
    );
    connection.deliver(consumer_id, encrypted).await;

    let message = app_rx
        .recv()
        .await
        .expect("Consume still delivers an undecryptable message");
    assert!(message.undecryptable);
    assert!(message.encryption_context.is_some());
    settle().await;

    assert!(
        !rpc.sent().await.iter().any(|cmd| matches!(cmd, OutboundCommand::Ack(_))),
        "Consume never auto-acks; the application decides"
    );
}
