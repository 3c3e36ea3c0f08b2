//! Tests for background callback delivery and draining.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use runnable_core::callbacks::{CallbackQueue, await_all_callbacks};
use runnable_core::globals::{get_debug, set_debug};
use runnable_core::runnables::{Runnable, RunnableConfig, RunnableLambda};
use runnable_core::tracers::RunCollector;
use serial_test::serial;

#[tokio::test]
async fn test_queue_runs_jobs_in_order() {
    let queue = CallbackQueue::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5u64 {
        let seen = seen.clone();
        queue.enqueue(format!("job {i}"), async move {
            tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
            seen.lock().push(i);
        });
    }
    queue.drain().await;
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_panicking_job_settles() {
    let queue = CallbackQueue::new(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    queue.enqueue("panics", async {
        panic!("job panicked");
    });
    {
        let seen = seen.clone();
        queue.enqueue("after", async move { seen.lock().push("after") });
    }
    queue.drain().await;
    assert_eq!(*seen.lock(), vec!["after"]);
}

#[tokio::test]
async fn test_drain_on_empty_queue_returns() {
    CallbackQueue::new(2).drain().await;
}

#[tokio::test]
#[serial]
async fn test_await_all_callbacks_flushes_background_handlers() {
    let collector = Arc::new(RunCollector::background());
    let chain = RunnableLambda::new(|x: i64| async move { Ok(x + 1) })
        .pipe(RunnableLambda::new(|x: i64| async move { Ok(x * 2) }));
    let config = RunnableConfig::new().with_handler(collector.clone());

    for x in 0..3 {
        chain.invoke(serde_json::json!(x), Some(config.clone())).await.unwrap();
    }
    await_all_callbacks().await;

    // A root and two steps per invocation.
    assert_eq!(collector.len(), 9);
    assert_eq!(collector.trees().len(), 3);
}

#[tokio::test]
#[serial]
async fn test_background_events_keep_dispatch_order() {
    let collector = Arc::new(RunCollector::background());
    let unit = RunnableLambda::new(|x: i64| async move { Ok(x) });
    let config = RunnableConfig::new().with_handler(collector.clone());
    for x in 0..5 {
        unit.invoke(x, Some(config.clone())).await.unwrap();
    }
    await_all_callbacks().await;

    let outputs: Vec<_> = collector
        .runs()
        .into_iter()
        .filter_map(|run| run.outputs)
        .collect();
    let expected: Vec<_> = (0..5).map(|x| serde_json::json!(x)).collect();
    assert_eq!(outputs, expected);
}

#[tokio::test]
#[serial]
async fn test_debug_mode_toggle() {
    set_debug(true);
    assert!(get_debug());

    let unit = RunnableLambda::new(|x: i64| async move { Ok(x) });
    assert_eq!(unit.invoke(5, None).await.unwrap(), 5);

    set_debug(false);
    await_all_callbacks().await;
}
