//! Tests for the retry wrapper.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use runnable_core::error::{AbortReason, Error};
use runnable_core::runnables::{
    ErrorClassifier, Runnable, RunnableConfig, RunnableLambda, RunnableRetryConfig,
};
use runnable_core::signal::AbortSignal;
use runnable_core::tracers::RunCollector;

/// A unit that fails with `error` for its first `failures` calls.
fn flaky(
    failures: usize,
    error: fn() -> Error,
    calls: Arc<AtomicUsize>,
) -> RunnableLambda<String, String> {
    RunnableLambda::new(move |input: String| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(error())
            } else {
                Ok(format!("{input} after {} calls", n + 1))
            }
        }
    })
}

fn unavailable() -> Error {
    Error::api(503, "service unavailable")
}

fn no_wait() -> RunnableRetryConfig {
    RunnableRetryConfig::builder()
        .wait_exponential_jitter(false)
        .build()
}

#[tokio::test]
async fn test_retry_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retrying = flaky(2, unavailable, calls.clone()).with_retry(no_wait());

    let output = retrying.invoke("ping".into(), None).await.unwrap();
    assert_eq!(output, "ping after 3 calls");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_returns_last_error_when_attempts_run_out() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = RunnableRetryConfig::builder()
        .max_attempt_number(2)
        .wait_exponential_jitter(false)
        .build();
    let retrying = flaky(5, unavailable, calls.clone()).with_retry(config);

    let error = retrying.invoke("ping".into(), None).await.unwrap_err();
    assert!(matches!(error, Error::Api { status: 503, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unhandled_error_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let retrying = flaky(5, || Error::api(400, "bad request"), calls.clone()).with_retry(no_wait());

    assert!(retrying.invoke("ping".into(), None).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_custom_classifier() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = RunnableRetryConfig::builder()
        .classifier(ErrorClassifier::Custom(|e| matches!(e, Error::InvalidInput(_))))
        .wait_exponential_jitter(false)
        .build();
    let retrying = flaky(1, || Error::invalid_input("try again"), calls.clone()).with_retry(config);

    assert!(retrying.invoke("ping".into(), None).await.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_attempts_are_reported() {
    let calls = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let attempts = attempts.clone();
        Arc::new(move |_: &Error, attempt: usize| attempts.lock().push(attempt))
    };
    let config = RunnableRetryConfig::builder()
        .wait_exponential_jitter(false)
        .on_failed_attempt(hook)
        .build();
    let collector = Arc::new(RunCollector::new());
    let retrying = flaky(2, unavailable, calls).with_retry(config);
    let run_config = RunnableConfig::new().with_handler(collector.clone());

    retrying.invoke("ping".into(), Some(run_config)).await.unwrap();
    assert_eq!(*attempts.lock(), vec![1, 2]);

    let trees = collector.trees();
    assert_eq!(trees.len(), 1);
    let root = &trees[0];
    let retry_events = root.events.iter().filter(|e| e.name == "retry").count();
    assert_eq!(retry_events, 2);

    let attempt_tags: Vec<Vec<String>> = root.child_runs.iter().map(|r| r.tags.clone()).collect();
    assert_eq!(
        attempt_tags,
        vec![
            vec![],
            vec!["retry:attempt:2".to_string()],
            vec!["retry:attempt:3".to_string()],
        ]
    );
}

#[tokio::test]
async fn test_abort_during_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = RunnableRetryConfig::builder()
        .initial_delay(Duration::from_secs(10))
        .max_delay(Duration::from_secs(10))
        .build();
    let retrying = flaky(5, unavailable, calls.clone()).with_retry(config);

    let signal = AbortSignal::new();
    let trigger = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.abort();
    });

    let started = Instant::now();
    let error = retrying
        .invoke("ping".into(), Some(RunnableConfig::new().with_signal(signal)))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Aborted(AbortReason::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_retries_only_failed_items() {
    let calls: Arc<Mutex<HashMap<i64, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let unit = {
        let calls = calls.clone();
        RunnableLambda::new(move |x: i64| {
            let calls = calls.clone();
            async move {
                let n = {
                    let mut calls = calls.lock();
                    let n = calls.entry(x).or_insert(0);
                    *n += 1;
                    *n
                };
                if x == 2 && n == 1 {
                    Err(unavailable())
                } else {
                    Ok(x * 10)
                }
            }
        })
    };
    let retrying = unit.with_retry(no_wait());

    let results = retrying.batch_with_exceptions(vec![1, 2, 3], None).await;
    let outputs: Vec<i64> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(outputs, vec![10, 20, 30]);

    let calls = calls.lock();
    assert_eq!(calls[&1], 1);
    assert_eq!(calls[&2], 2);
    assert_eq!(calls[&3], 1);
}

#[tokio::test]
async fn test_batch_keeps_unretried_failures() {
    let unit = RunnableLambda::new(|x: i64| async move {
        if x < 0 {
            Err(Error::invalid_input("negative"))
        } else {
            Ok(x)
        }
    });
    let retrying = unit.with_retry(no_wait());
    let results = retrying.batch_with_exceptions(vec![1, -1], None).await;
    assert_eq!(*results[0].as_ref().unwrap(), 1);
    assert!(matches!(results[1], Err(Error::InvalidInput(_))));
}
