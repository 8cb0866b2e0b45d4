use std::sync::Arc;
use std::time::Duration;

use keel_scheduler::{AsyncQueue, DependencyTracker};
use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    StateChange,
    StateRead,
    Progress,
}

impl DependencyTracker for Kind {
    fn is_dependency(&self, other: &Self) -> bool {
        match (self, other) {
            (Kind::StateChange, _) => true,
            (Kind::StateRead, Kind::StateChange) => true,
            (Kind::StateRead, _) => false,
            (Kind::Progress, Kind::Progress) => true,
            (Kind::Progress, _) => false,
        }
    }
}

#[tokio::test]
async fn state_changes_run_in_enqueue_order() {
    let queue = AsyncQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let log = Arc::clone(&log);
        handles.push(queue.spawn(Kind::StateChange, move || async move {
            // Earlier operations sleep longer; ordering must still hold.
            tokio::time::sleep(Duration::from_millis(u64::from(20 - i))).await;
            log.lock().push(i);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn reads_wait_for_earlier_state_change_but_not_for_each_other() {
    let queue = AsyncQueue::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let log = Arc::new(Mutex::new(Vec::new()));

    let change_log = Arc::clone(&log);
    let change = queue.spawn(Kind::StateChange, move || async move {
        let _ = release_rx.await;
        change_log.lock().push("change");
    });

    // Two reads that block each other would deadlock here: the second one releases the
    // first.
    let (read_a_tx, read_a_rx) = oneshot::channel::<()>();
    let read_log = Arc::clone(&log);
    let read_a = queue.spawn(Kind::StateRead, move || async move {
        let _ = read_a_rx.await;
        read_log.lock().push("read-a");
    });
    let read_log = Arc::clone(&log);
    let read_b = queue.spawn(Kind::StateRead, move || async move {
        read_log.lock().push("read-b");
        let _ = read_a_tx.send(());
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(log.lock().is_empty(), "reads must wait for the state change");

    release_tx.send(()).unwrap();
    change.await.unwrap();
    read_b.await.unwrap();
    read_a.await.unwrap();

    assert_eq!(*log.lock(), vec!["change", "read-b", "read-a"]);
}

#[tokio::test]
async fn progress_is_independent_of_state_changes() {
    let queue = AsyncQueue::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let change = queue.spawn(Kind::StateChange, move || async move {
        let _ = release_rx.await;
    });
    let progress = queue.spawn(Kind::Progress, || async { "progress" });

    assert_eq!(progress.await.unwrap(), "progress");
    release_tx.send(()).unwrap();
    change.await.unwrap();
}

#[tokio::test]
async fn wait_for_blocks_until_conflicting_work_finishes() {
    let queue = AsyncQueue::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let done = Arc::new(Mutex::new(false));

    let change_done = Arc::clone(&done);
    let _change = queue.spawn(Kind::StateChange, move || async move {
        let _ = release_rx.await;
        *change_done.lock() = true;
    });

    let waiter_queue = queue.clone();
    let waiter = tokio::spawn(async move {
        waiter_queue.wait_for(&Kind::StateRead).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    release_tx.send(()).unwrap();
    waiter.await.unwrap();
    assert!(*done.lock());
}
