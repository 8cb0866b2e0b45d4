use std::sync::Arc;
use std::time::Duration;

use keel_scheduler::{race_with_timeout, TimedOut};
use parking_lot::Mutex;
use tokio::sync::oneshot;

#[tokio::test(start_paused = true)]
async fn slow_future_keeps_running_after_timeout() {
    let late = Arc::new(Mutex::new(None));
    let late_sink = Arc::clone(&late);
    let (seen_tx, seen_rx) = oneshot::channel::<()>();

    let result = race_with_timeout(
        Duration::from_millis(50),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            "real answer"
        },
        move |output| {
            *late_sink.lock() = Some(output);
            let _ = seen_tx.send(());
        },
    )
    .await;

    assert_eq!(result, Err(TimedOut(Duration::from_millis(50))));
    assert_eq!(*late.lock(), None);

    seen_rx.await.unwrap();
    assert_eq!(*late.lock(), Some("real answer"));
}
