#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the message bus: fan-out, ordering under concurrent
//! publishers, and failure isolation.

use maestro_core::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>, n: usize) -> Vec<Arc<Message>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("bus closed");
        out.push(msg);
    }
    out
}

// ---------------------------------------------------------------------------
// 1. Every subscriber observes the same per-topic order
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_yield_consistent_order() {
    let bus = Arc::new(MessageBus::default());
    let (_a, mut rx_a) = bus.subscribe_channel("audit");
    let (_b, mut rx_b) = bus.subscribe_channel("audit");

    let mut handles = Vec::new();
    for publisher in 0..4 {
        let bus = Arc::clone(&bus);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                bus.publish(
                    "audit",
                    format!("p{publisher}"),
                    MessageKind::Event,
                    json!({"p": publisher, "i": i}),
                    "run",
                );
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let seen_a: Vec<_> = drain(&mut rx_a, 100).await.iter().map(|m| m.id).collect();
    let seen_b: Vec<_> = drain(&mut rx_b, 100).await.iter().map(|m| m.id).collect();
    assert_eq!(seen_a, seen_b);
}

// ---------------------------------------------------------------------------
// 2. Per-publisher order survives interleaving
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_publisher_order_is_preserved() {
    let bus = Arc::new(MessageBus::default());
    let (_sub, mut rx) = bus.subscribe_channel("seq");
    let noise = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            for _ in 0..50 {
                bus.publish("other", "noise", MessageKind::Event, json!(null), "x");
                tokio::task::yield_now().await;
            }
        })
    };
    for i in 0..50 {
        bus.publish("seq", "main", MessageKind::Event, json!(i), "run");
    }
    noise.await.unwrap();

    let got: Vec<i64> = drain(&mut rx, 50)
        .await
        .iter()
        .map(|m| m.payload.as_i64().unwrap())
        .collect();
    assert_eq!(got, (0..50).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// 3. Slow and failing subscribers do not hold anyone back
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_subscriber_does_not_delay_others() {
    let bus = MessageBus::default();

    struct Sleepy;
    #[async_trait::async_trait]
    impl MessageHandler for Sleepy {
        async fn handle(&self, _message: Arc<Message>) -> MaestroResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    bus.subscribe("t", Arc::new(Sleepy));
    bus.subscribe("t", handler_fn(|_| Err(MaestroError::Handler("nope".into()))));
    let (_sub, mut rx) = bus.subscribe_channel("t");

    bus.publish("t", "s", MessageKind::Result, json!("ok"), "c");
    let got = drain(&mut rx, 1).await;
    assert_eq!(got[0].payload, json!("ok"));
    assert_eq!(bus.subscriber_count("t"), 3);
}

// ---------------------------------------------------------------------------
// 4. History can be queried per run
// ---------------------------------------------------------------------------

#[test]
fn history_by_correlation_id() {
    let bus = MessageBus::default();
    bus.publish("t", "s", MessageKind::Event, json!(1), "run-a");
    bus.publish("t", "s", MessageKind::Event, json!(2), "run-b");
    bus.publish("u", "s", MessageKind::Result, json!(3), "run-a");

    let filter = HistoryFilter {
        correlation_id: Some("run-a".into()),
        ..Default::default()
    };
    let got = bus.history(&filter, 100);
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(|m| m.correlation_id == "run-a"));
}
