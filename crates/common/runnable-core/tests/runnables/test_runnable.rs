//! Tests for the single-unit lifecycle: invoke, batch, recursion and naming.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use runnable_core::error::Error;
use runnable_core::runnables::{
    BatchResults, DynRunnable, Runnable, RunnableConfig, RunnableLambda,
};
use runnable_core::tracers::{RunCollector, RunType};

fn add_one() -> RunnableLambda<i64, i64> {
    RunnableLambda::new(|x: i64| async move { Ok(x + 1) })
}

fn fail_on_odd() -> RunnableLambda<i64, i64> {
    RunnableLambda::new(|x: i64| async move {
        if x % 2 == 1 {
            Err(Error::other(format!("odd input {x}")))
        } else {
            Ok(x)
        }
    })
}

/// `levels` lambdas nested inside each other, each adding one.
fn nested(levels: usize) -> DynRunnable<i64, i64> {
    if levels == 0 {
        return RunnableLambda::new(|x: i64| async move { Ok(x) }).into_dyn();
    }
    let inner = nested(levels - 1);
    RunnableLambda::new_with_config(move |x: i64, config: RunnableConfig| {
        let inner = inner.clone();
        async move { inner.invoke(x + 1, Some(config)).await }
    })
    .into_dyn()
}

#[tokio::test]
async fn test_batch_of_one_matches_invoke() {
    let runnable = add_one();
    for x in [-3, 0, 41] {
        let invoked = runnable.invoke(x, None).await.unwrap();
        let batched = runnable.batch(vec![x], None).await.unwrap();
        assert_eq!(batched, vec![invoked]);
    }

    let failing = fail_on_odd();
    let invoked = failing.invoke(1, None).await.unwrap_err();
    let batched = failing.batch(vec![1], None).await.unwrap_err();
    assert_eq!(invoked.to_string(), batched.to_string());
}

#[tokio::test]
async fn test_batch_preserves_input_order() {
    let slow_for_small = RunnableLambda::new(|x: u64| async move {
        tokio::time::sleep(Duration::from_millis(40 - x * 10)).await;
        Ok(x)
    });
    let outputs = slow_for_small.batch(vec![0, 1, 2, 3], None).await.unwrap();
    assert_eq!(outputs, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_batch_respects_max_concurrency() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runnable = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        RunnableLambda::new(move |x: i64| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(x)
            }
        })
    };

    let config = RunnableConfig::new().with_max_concurrency(2);
    let outputs = runnable.batch((0..10).collect(), Some(config)).await.unwrap();
    assert_eq!(outputs.len(), 10);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_batch_with_exceptions_keeps_each_outcome() {
    let results = fail_on_odd().batch_with_exceptions(vec![0, 1, 2, 3], None).await;
    assert_eq!(results.len(), 4);
    assert_eq!(*results[0].as_ref().unwrap(), 0);
    assert!(results[1].is_err());
    assert_eq!(*results[2].as_ref().unwrap(), 2);
    assert!(results[3].is_err());

    match results.into_aggregate() {
        Err(Error::AggregateBatch { errors }) => {
            let indices: Vec<usize> = errors.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, vec![1, 3]);
        }
        other => panic!("expected an aggregate error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_fails_fast() {
    let error = fail_on_odd().batch(vec![0, 2, 3, 4], None).await.unwrap_err();
    assert_eq!(error.to_string(), "odd input 3");
}

#[tokio::test]
async fn test_empty_batch() {
    assert!(add_one().batch(vec![], None).await.unwrap().is_empty());
    assert!(add_one().batch_with_exceptions(vec![], None).await.is_empty());
}

#[tokio::test]
async fn test_recursion_within_limit() {
    let config = RunnableConfig::new().with_recursion_limit(3);
    assert_eq!(nested(3).invoke(0, Some(config)).await.unwrap(), 3);
}

#[tokio::test]
async fn test_recursion_limit_exceeded() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new()
        .with_recursion_limit(2)
        .with_handler(collector.clone());

    let error = nested(3).invoke(0, Some(config)).await.unwrap_err();
    assert!(matches!(error, Error::RecursionLimit { limit: 2 }));

    // Every run on the path down to the failing one ends with the error.
    assert_eq!(collector.errored_runs().len(), 4);
    assert!(collector.successful_runs().is_empty());
}

#[tokio::test]
async fn test_ambient_config_counts_depth() {
    let inner = add_one().into_dyn();
    let outer = RunnableLambda::new(move |x: i64| {
        let inner = inner.clone();
        async move { inner.invoke(x, None).await }
    });
    let config = RunnableConfig::new().with_recursion_limit(0);
    assert!(matches!(
        outer.invoke(1, Some(config)).await,
        Err(Error::RecursionLimit { limit: 0 })
    ));
    assert_eq!(outer.invoke(1, None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_run_name_and_type() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new()
        .with_run_name("renamed")
        .with_handler(collector.clone());
    add_one().invoke(1, Some(config)).await.unwrap();

    let run = collector.latest_run().unwrap();
    assert_eq!(run.name, "renamed");
    assert_eq!(run.run_type, RunType::Chain);
    assert_eq!(run.inputs, serde_json::json!(1));
    assert_eq!(run.outputs, Some(serde_json::json!(2)));
}

#[tokio::test]
async fn test_each_applies_to_every_element() {
    let each = add_one().map();
    assert_eq!(each.invoke(vec![1, 2, 3], None).await.unwrap(), vec![2, 3, 4]);
    assert_eq!(each.get_name(), "RunnableEach<RunnableLambda>");
}
