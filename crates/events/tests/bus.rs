//! Integration tests for the event bus.
//!
//! These exercise the bus directly with synthetic consumers: total
//! ordering across consumers, join/leave semantics, retirement of failing
//! consumers, producer backpressure, and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use metacat_core::event::{ChangeEvent, EventKind};
use metacat_events::{BusError, ConsumerError, EventBus, EventConsumer, FnConsumer};

fn event(seq: i64) -> ChangeEvent {
    ChangeEvent::new(EventKind::EntityCreated, "table", Uuid::new_v4())
        .with_versions(None, seq as f64)
}

fn seq_of(event: &ChangeEvent) -> i64 {
    event.current_version as i64
}

/// Collects the sequence numbers it observes.
fn collector(
    seen: Arc<Mutex<Vec<i64>>>,
) -> FnConsumer<impl FnMut(Arc<ChangeEvent>, bool) -> Result<(), ConsumerError> + Send + 'static> {
    FnConsumer::new(move |event, _end_of_batch| {
        seen.lock().unwrap().push(seq_of(&event));
        Ok(())
    })
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Blocks inside `on_event` for the first event until released, then
/// records `(seq, end_of_batch)` for every event.
struct BlockingConsumer {
    release: Arc<Notify>,
    seen: Arc<Mutex<Vec<(i64, bool)>>>,
    blocked_once: bool,
}

#[async_trait]
impl EventConsumer for BlockingConsumer {
    async fn on_event(
        &mut self,
        event: Arc<ChangeEvent>,
        end_of_batch: bool,
    ) -> Result<(), ConsumerError> {
        if !self.blocked_once {
            self.blocked_once = true;
            self.release.notified().await;
        }
        self.seen.lock().unwrap().push((seq_of(&event), end_of_batch));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test: every consumer observes the same total publish order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_consumers_observe_identical_order() {
    let bus = Arc::new(EventBus::new(64));

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(collector(Arc::clone(&seen_a))).unwrap();
    bus.add_consumer(collector(Arc::clone(&seen_b))).unwrap();

    // Two concurrent publishers with disjoint sequence ranges.
    let first = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            for seq in 0..50 {
                bus.publish(event(seq)).await.unwrap();
            }
        })
    };
    let second = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            for seq in 100..150 {
                bus.publish(event(seq)).await.unwrap();
            }
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    wait_until(|| seen_a.lock().unwrap().len() == 100 && seen_b.lock().unwrap().len() == 100)
        .await;

    let order_a = seen_a.lock().unwrap().clone();
    let order_b = seen_b.lock().unwrap().clone();
    assert_eq!(order_a, order_b, "consumers disagree on publish order");

    // Within each publisher, order is preserved.
    let from_first: Vec<i64> = order_a.iter().copied().filter(|s| *s < 100).collect();
    let from_second: Vec<i64> = order_a.iter().copied().filter(|s| *s >= 100).collect();
    assert_eq!(from_first, (0..50).collect::<Vec<_>>());
    assert_eq!(from_second, (100..150).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Test: a consumer joins from the current tail, with no backlog replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consumer_joins_from_current_tail() {
    let bus = EventBus::new(16);

    for seq in 0..3 {
        bus.publish(event(seq)).await.unwrap();
    }
    // Let the dispatcher drain the pre-join events.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(collector(Arc::clone(&seen))).unwrap();

    bus.publish(event(3)).await.unwrap();
    bus.publish(event(4)).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
}

// ---------------------------------------------------------------------------
// Test: remove_consumer stops delivery to that consumer only
// ---------------------------------------------------------------------------

#[tokio::test]
async fn removed_consumer_stops_receiving() {
    let bus = EventBus::new(16);

    let seen_kept = Arc::new(Mutex::new(Vec::new()));
    let seen_removed = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(collector(Arc::clone(&seen_kept))).unwrap();
    let handle = bus.add_consumer(collector(Arc::clone(&seen_removed))).unwrap();

    bus.publish(event(0)).await.unwrap();
    wait_until(|| seen_removed.lock().unwrap().len() == 1).await;

    bus.remove_consumer(handle).await;

    bus.publish(event(1)).await.unwrap();
    bus.publish(event(2)).await.unwrap();
    wait_until(|| seen_kept.lock().unwrap().len() == 3).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen_removed.lock().unwrap(), vec![0]);
    assert_eq!(*seen_kept.lock().unwrap(), vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Test: a failing consumer is retired without affecting others
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_consumer_is_retired_and_observable() {
    let bus = EventBus::new(16);

    let healthy = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(collector(Arc::clone(&healthy))).unwrap();

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&failing_calls);
    let handle = bus
        .add_consumer(FnConsumer::new(move |_event, _end_of_batch| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConsumerError::new("handler blew up"))
        }))
        .unwrap();
    assert!(!handle.is_terminated());

    bus.publish(event(0)).await.unwrap();
    wait_until(|| handle.is_terminated()).await;

    // The retired consumer handles nothing further; the healthy one is
    // unaffected.
    bus.publish(event(1)).await.unwrap();
    wait_until(|| healthy.lock().unwrap().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*healthy.lock().unwrap(), vec![0, 1]);

    // Removal of the dead consumer still completes.
    bus.remove_consumer(handle).await;
}

// ---------------------------------------------------------------------------
// Test: a stalled consumer applies backpressure to the publisher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stalled_consumer_backpressures_publisher() {
    let bus = Arc::new(EventBus::new(2));

    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(BlockingConsumer {
        release: Arc::clone(&release),
        seen: Arc::clone(&seen),
        blocked_once: false,
    })
    .unwrap();

    let published = Arc::new(AtomicUsize::new(0));
    let publisher = {
        let bus = Arc::clone(&bus);
        let published = Arc::clone(&published);
        tokio::spawn(async move {
            for seq in 0..10 {
                bus.publish(event(seq)).await.unwrap();
                published.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // With capacity 2 the publisher must stall well before finishing.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stalled_at = published.load(Ordering::SeqCst);
    assert!(
        stalled_at < 10,
        "publisher should stall, published {stalled_at}"
    );

    release.notify_one();
    publisher.await.unwrap();
    wait_until(|| seen.lock().unwrap().len() == 10).await;
    assert_eq!(published.load(Ordering::SeqCst), 10);
}

// ---------------------------------------------------------------------------
// Test: end_of_batch reflects the buffered backlog
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_of_batch_signals_drained_backlog() {
    let bus = EventBus::new(8);

    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(BlockingConsumer {
        release: Arc::clone(&release),
        seen: Arc::clone(&seen),
        blocked_once: false,
    })
    .unwrap();

    for seq in 0..4 {
        bus.publish(event(seq)).await.unwrap();
    }
    // Let events 1..=3 queue up behind the blocked consumer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    release.notify_one();

    wait_until(|| seen.lock().unwrap().len() == 4).await;
    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    // With a backlog of three buffered events, only the last one reports
    // the backlog drained.
    assert!(!seen[1].1);
    assert!(!seen[2].1);
    assert!(seen[3].1);
}

// ---------------------------------------------------------------------------
// Test: shutdown closes the bus for publishers and registrations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_closes_the_bus() {
    let bus = EventBus::new(16);

    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_consumer(collector(Arc::clone(&seen))).unwrap();

    bus.publish(event(0)).await.unwrap();
    wait_until(|| seen.lock().unwrap().len() == 1).await;

    bus.shutdown().await;

    assert!(matches!(bus.publish(event(1)).await, Err(BusError::Closed)));
    let seen_late = Arc::new(Mutex::new(Vec::new()));
    assert!(matches!(
        bus.add_consumer(collector(seen_late)),
        Err(BusError::Closed)
    ));
}
