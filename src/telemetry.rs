//! Telemetry emitted by the partition consumer.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::Counter;
use prometheus::CounterVec;
use prometheus::Gauge;
use prometheus::Opts;

/// Total number of messages delivered to the application channel.
pub static DELIVERED_COUNT: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "partition_consumer_delivered_count",
        "Total number of messages delivered to the application channel",
    )
    .expect("failed to initialise DELIVERED_COUNT counter")
});

/// Total number of messages diverted to the dead-letter queue.
pub static DLQ_COUNT: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "partition_consumer_dlq_count",
        "Total number of messages diverted to the dead-letter queue",
    )
    .expect("failed to initialise DLQ_COUNT counter")
});

/// Total number of messages discarded by start-position filtering.
pub static DISCARDED_COUNT: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "partition_consumer_discarded_count",
        "Total number of messages discarded by start-position filtering",
    )
    .expect("failed to initialise DISCARDED_COUNT counter")
});

/// Number of receive-pipeline failures, labelled by stage.
pub static RECEIVE_ERR: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new(
            "partition_consumer_receive_errors",
            "Number of receive pipeline failures by stage",
        ),
        &["stage"],
    )
    .expect("failed to initialise RECEIVE_ERR counter")
});

/// Total number of `Flow` permit RPCs issued.
pub static FLOW_COUNT: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "partition_consumer_flow_count",
        "Total number of Flow permit RPCs issued",
    )
    .expect("failed to initialise FLOW_COUNT counter")
});

/// Total number of broker reconnect attempts.
pub static RECONNECT_COUNT: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "partition_consumer_reconnect_count",
        "Total number of broker reconnect attempts",
    )
    .expect("failed to initialise RECONNECT_COUNT counter")
});

/// Current number of messages sitting in the prefetch queue.
pub static PREFETCHED_MESSAGES: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new(
        "partition_consumer_prefetched_messages",
        "Current number of messages sitting in the prefetch queue",
    )
    .expect("failed to initialise PREFETCHED_MESSAGES gauge")
});

/// Ensure metrics are registered only once.
static METRICS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Register all partition consumer metrics with the given [`prometheus::Registry`].
///
/// The first call wins; subsequent calls are a no-op so multiple consumers in the
/// same process can all call this during their own construction.
pub fn register_metrics(reg: &prometheus::Registry) -> Result<()> {
    if METRICS_REGISTERED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let counters: [Box<dyn prometheus::core::Collector>; 7] = [
        Box::new(DELIVERED_COUNT.clone()),
        Box::new(DLQ_COUNT.clone()),
        Box::new(DISCARDED_COUNT.clone()),
        Box::new(RECEIVE_ERR.clone()),
        Box::new(FLOW_COUNT.clone()),
        Box::new(RECONNECT_COUNT.clone()),
        Box::new(PREFETCHED_MESSAGES.clone()),
    ];
    for collector in counters {
        reg.register(collector)?;
    }
    Ok(())
}
