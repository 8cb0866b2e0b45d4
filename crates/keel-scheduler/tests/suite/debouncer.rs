use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use keel_scheduler::Debouncer;
use parking_lot::Mutex;

type Deliveries = Arc<Mutex<Vec<BTreeSet<&'static str>>>>;

fn set_debouncer(delay: Duration) -> (Debouncer<BTreeSet<&'static str>>, Deliveries) {
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    let debouncer = Debouncer::new(
        delay,
        |mut lhs: BTreeSet<&'static str>, rhs| {
            lhs.extend(rhs);
            lhs
        },
        move |batch| {
            let sink = Arc::clone(&sink);
            async move { sink.lock().push(batch) }
        },
    );
    (debouncer, deliveries)
}

fn set(items: &[&'static str]) -> BTreeSet<&'static str> {
    items.iter().copied().collect()
}

#[tokio::test(start_paused = true)]
async fn calls_within_window_are_merged_into_one_delivery() {
    let (debouncer, deliveries) = set_debouncer(Duration::from_millis(100));

    debouncer.schedule_call(set(&["x"]));
    tokio::time::sleep(Duration::from_millis(60)).await;
    debouncer.schedule_call(set(&["y"]));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(deliveries.lock().is_empty(), "second call restarts the timer");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*deliveries.lock(), vec![set(&["x", "y"])]);
}

#[tokio::test(start_paused = true)]
async fn flush_delivers_pending_batch_without_later_call() {
    let (debouncer, deliveries) = set_debouncer(Duration::from_millis(100));

    debouncer.schedule_call(set(&["x"]));
    debouncer.schedule_call(set(&["y"]));
    debouncer.flush().await;
    assert_eq!(*deliveries.lock(), vec![set(&["x", "y"])]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(deliveries.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn flush_without_pending_batch_is_a_no_op() {
    let (debouncer, deliveries) = set_debouncer(Duration::from_millis(10));
    debouncer.flush().await;
    assert!(deliveries.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn separate_windows_produce_separate_deliveries() {
    let (debouncer, deliveries) = set_debouncer(Duration::from_millis(20));

    debouncer.schedule_call(set(&["a"]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    debouncer.schedule_call(set(&["b"]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*deliveries.lock(), vec![set(&["a"]), set(&["b"])]);
}

#[tokio::test(start_paused = true)]
async fn flush_waits_for_delivery_in_progress() {
    let finished = Arc::new(Mutex::new(false));
    let sink_finished = Arc::clone(&finished);
    let debouncer = Debouncer::new(
        Duration::from_millis(10),
        |lhs: u32, rhs: u32| lhs.max(rhs),
        move |_batch| {
            let sink_finished = Arc::clone(&sink_finished);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                *sink_finished.lock() = true;
            }
        },
    );

    debouncer.schedule_call(1);
    // Let the timer fire and enter the slow sink.
    tokio::time::sleep(Duration::from_millis(20)).await;
    debouncer.flush().await;
    assert!(*finished.lock());
}
