//! Dead-letter redrive: manual redrive, parking and scheduled backoff.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use courier_core::bus::{Broker, Exchange, QueueSpec};
use courier_core::envelope::{Envelope, headers};
use courier_core::environment::{Clock, SystemClock};
use courier_runtime::broker::InMemoryBroker;
use courier_runtime::config::RedriveConfig;
use courier_runtime::redrive::{RedriveReport, Redriver};
use courier_testing::{ManualClock, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const QUEUE: &str = "work.q";
const DLQ: &str = "dlq.work.q";
const PARKED: &str = "parked.work.q";

async fn broker() -> Arc<InMemoryBroker> {
    declared(InMemoryBroker::default()).await
}

async fn declared(broker: InMemoryBroker) -> Arc<InMemoryBroker> {
    broker
        .declare_queue(QueueSpec::durable(DLQ).bind(Exchange::DeadLetter, DLQ))
        .await
        .unwrap();
    broker
        .declare_queue(
            QueueSpec::durable(QUEUE)
                .bind(Exchange::Events, "work.done")
                .dead_letter_to(DLQ),
        )
        .await
        .unwrap();
    Arc::new(broker)
}

/// Publish one message and reject it into the dead-letter queue.
async fn dead_letter_one(broker: &InMemoryBroker) {
    broker
        .publish(
            Exchange::Events,
            "work.done",
            Envelope::new("work.done", serde_json::json!({ "n": 1 })),
        )
        .await
        .unwrap();
    reject_head(broker).await;
}

async fn reject_head(broker: &InMemoryBroker) {
    let delivery = broker.fetch(QUEUE).await.unwrap().unwrap();
    delivery.nack(false).await.unwrap();
}

fn config(max_redrives: u32) -> RedriveConfig {
    RedriveConfig {
        max_redrives,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(300),
        ..RedriveConfig::default()
    }
}

#[tokio::test]
async fn redrive_moves_message_back_and_counts_it() {
    let broker = broker().await;
    dead_letter_one(&broker).await;
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(3), Arc::new(SystemClock));

    let report = redriver.redrive_once(QUEUE, 10).await.unwrap();

    assert_eq!(report, RedriveReport { redriven: 1, parked: 0, deferred: 0 });
    assert_eq!(broker.depth(DLQ).await.unwrap(), 0);
    let redriven = broker.peek(QUEUE).unwrap();
    assert_eq!(redriven.len(), 1);
    assert_eq!(redriven[0].redrive_count(), 1);
    assert_eq!(redriven[0].header(headers::DEATH_REASON), Some("rejected"));
}

#[tokio::test]
async fn exhausted_message_is_moved_to_parked_queue() {
    let broker = broker().await;
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(2), Arc::new(SystemClock));

    dead_letter_one(&broker).await;
    for _ in 0..2 {
        redriver.redrive_once(QUEUE, 10).await.unwrap();
        reject_head(&broker).await;
    }

    let report = redriver.redrive_once(QUEUE, 10).await.unwrap();
    assert_eq!(report.parked, 1);
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 0);
    assert_eq!(broker.depth(DLQ).await.unwrap(), 0);

    let parked = broker.peek(PARKED).unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].header(headers::PARKED), Some("true"));
    assert_eq!(parked[0].redrive_count(), 2);

    let again = redriver.redrive_once(QUEUE, 10).await.unwrap();
    assert_eq!(again, RedriveReport::default());
    assert_eq!(broker.depth(PARKED).await.unwrap(), 1);
}

#[tokio::test]
async fn fresh_message_behind_parked_ones_is_redriven() {
    let broker = broker().await;
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(1), Arc::new(SystemClock));

    // Two messages exhaust their single redrive
    dead_letter_one(&broker).await;
    dead_letter_one(&broker).await;
    redriver.redrive_once(QUEUE, 10).await.unwrap();
    reject_head(&broker).await;
    reject_head(&broker).await;
    dead_letter_one(&broker).await;
    assert_eq!(broker.depth(DLQ).await.unwrap(), 3);

    let report = redriver.redrive_once(QUEUE, 2).await.unwrap();

    assert_eq!(report, RedriveReport { redriven: 1, parked: 2, deferred: 0 });
    assert_eq!(broker.depth(DLQ).await.unwrap(), 0);
    assert_eq!(broker.depth(PARKED).await.unwrap(), 2);
    let redriven = broker.peek(QUEUE).unwrap();
    assert_eq!(redriven.len(), 1);
    assert_eq!(redriven[0].redrive_count(), 1);
}

#[tokio::test]
async fn redrive_limit_counts_only_moved_messages() {
    let broker = broker().await;
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(3), Arc::new(SystemClock));
    for _ in 0..3 {
        dead_letter_one(&broker).await;
    }

    let report = redriver.redrive_once(QUEUE, 2).await.unwrap();

    assert_eq!(report.redriven, 2);
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 2);
    assert_eq!(broker.depth(DLQ).await.unwrap(), 1);
}

#[tokio::test]
async fn sweep_waits_for_backoff() {
    let broker = broker().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(3), clock.clone());
    dead_letter_one(&broker).await;

    let early = redriver.sweep().await;
    assert_eq!(early.deferred, 1);
    assert_eq!(broker.depth(DLQ).await.unwrap(), 1);

    clock.advance(chrono::Duration::seconds(31));
    let due = redriver.sweep().await;
    assert_eq!(due.redriven, 1);
    assert_eq!(broker.depth(QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn sweep_reaches_due_message_behind_deferred_one() {
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let broker = declared(InMemoryBroker::default().with_clock(clock.clone())).await;
    let redriver = Redriver::new(
        broker.clone(),
        vec![QUEUE.to_string()],
        RedriveConfig {
            batch_size: 1,
            ..config(3)
        },
        clock.clone(),
    );

    // Head message was redriven once, so it waits 60s instead of 30s
    dead_letter_one(&broker).await;
    redriver.redrive_once(QUEUE, 1).await.unwrap();
    reject_head(&broker).await;
    dead_letter_one(&broker).await;

    clock.advance(chrono::Duration::seconds(31));
    let report = redriver.sweep().await;

    assert_eq!(report, RedriveReport { redriven: 1, parked: 0, deferred: 1 });
    let waiting = broker.peek(DLQ).unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].redrive_count(), 1);
    assert_eq!(broker.peek(QUEUE).unwrap()[0].redrive_count(), 1);
}

#[tokio::test]
async fn death_time_comes_from_broker_clock() {
    let start = test_clock().now();
    let clock = Arc::new(ManualClock::new(start));
    let broker = declared(InMemoryBroker::default().with_clock(clock.clone())).await;
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(3), clock.clone());
    dead_letter_one(&broker).await;

    let dead = broker.peek(DLQ).unwrap();
    assert_eq!(dead[0].header(headers::DEATH_AT), Some(start.to_rfc3339().as_str()));

    assert_eq!(redriver.sweep().await.deferred, 1);
    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(redriver.sweep().await.redriven, 1);
}

#[tokio::test]
async fn deferred_messages_keep_their_order() {
    let broker = broker().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let redriver = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config(3), clock);

    for n in 0..3 {
        broker
            .publish(
                Exchange::Events,
                "work.done",
                Envelope::new("work.done", serde_json::json!({ "n": n })),
            )
            .await
            .unwrap();
        reject_head(&broker).await;
    }

    redriver.sweep().await;

    let order: Vec<i64> = broker
        .peek(DLQ)
        .unwrap()
        .iter()
        .map(|e| e.data["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn spawned_redriver_runs_until_shutdown() {
    let broker = broker().await;
    dead_letter_one(&broker).await;
    let config = RedriveConfig {
        interval: Duration::from_millis(10),
        initial_backoff: Duration::ZERO,
        ..RedriveConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = Redriver::new(broker.clone(), vec![QUEUE.to_string()], config, Arc::new(SystemClock))
        .spawn(shutdown_rx);

    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.depth(QUEUE).await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
