//! In-process broker benchmarks: publish fan-out and consume/ack round-trip
//!
//! Run with: `cargo bench --bench broker`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use courier_core::bus::{Broker, Exchange, QueueSpec};
use courier_core::envelope::Envelope;
use courier_core::routing::RoutingTable;
use courier_runtime::broker::InMemoryBroker;
use courier_runtime::config::CourierConfig;
use courier_runtime::topology::Topology;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

// ============================================================================
// Benchmark Fixtures
// ============================================================================

fn envelope() -> Envelope {
    Envelope::new(
        "step.state.changed",
        serde_json::json!({ "step_id": "offer-1:0", "current": "PICKED_UP" }),
    )
}

async fn standard_broker() -> InMemoryBroker {
    let config = CourierConfig::default();
    let broker = InMemoryBroker::new(config.broker.clone());
    Topology::from_table(&RoutingTable::standard(), &config.broker, &config.rpc)
        .declare(&broker)
        .await
        .expect("topology declares");
    broker
}

// ============================================================================
// Benchmarks
// ============================================================================

/// Publish one event through the full standard topology and drain it.
fn bench_publish_standard_topology(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_publish");
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let broker = runtime.block_on(standard_broker());
    let queue = "shipments.event.step-state-changed.queue";

    group.bench_function("publish_and_ack", |b| {
        b.to_async(&runtime).iter(|| async {
            broker
                .publish(Exchange::Events, "step.state.changed", black_box(envelope()))
                .await
                .expect("publish");
            let delivery = broker
                .fetch(queue)
                .await
                .expect("fetch")
                .expect("message");
            delivery.ack().await.expect("ack");
        });
    });

    group.finish();
}

/// Topic matching cost against a wildcard-heavy binding set.
fn bench_topic_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_fanout");
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let broker = InMemoryBroker::default();
    runtime.block_on(async {
        for i in 0..10 {
            broker
                .declare_queue(
                    QueueSpec::durable(format!("audit-{i}.event.all.queue"))
                        .bind(Exchange::Events, "#")
                        .with_max_length(1),
                )
                .await
                .expect("declare");
        }
    });

    group.bench_function("publish_to_10_wildcard_queues", |b| {
        b.to_async(&runtime).iter(|| async {
            broker
                .publish(Exchange::Events, "step.state.changed", black_box(envelope()))
                .await
                .expect("publish");
        });
    });

    group.finish();
}

criterion_group!(benches, bench_publish_standard_topology, bench_topic_fanout);
criterion_main!(benches);
