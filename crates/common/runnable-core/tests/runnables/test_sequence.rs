//! Tests for sequence composition, flattening, batching and streaming.

use std::sync::Arc;

use futures::StreamExt;
use runnable_core::error::Error;
use runnable_core::runnables::{
    Runnable, RunnableConfig, RunnableLambda, RunnablePassthrough, RunnableSequence,
};
use runnable_core::tracers::RunCollector;
use serde_json::{Value, json};

fn add(n: i64) -> RunnableLambda<i64, i64> {
    RunnableLambda::new(move |x: i64| async move { Ok(x + n) })
}

fn double() -> RunnableLambda<i64, i64> {
    RunnableLambda::new(|x: i64| async move { Ok(x * 2) })
}

#[tokio::test]
async fn test_sequence_is_function_composition() {
    let sequence = add(3).pipe(double());
    for x in [-2, 0, 5] {
        let expected = double().invoke(add(3).invoke(x, None).await.unwrap(), None).await.unwrap();
        assert_eq!(sequence.invoke(json!(x), None).await.unwrap(), json!(expected));
    }
}

#[tokio::test]
async fn test_nested_sequences_are_flattened() {
    let left = add(1).pipe(double());
    let right = add(2).pipe(double());
    let sequence = left.pipe(right);
    assert_eq!(sequence.steps().len(), 4);

    let extended = sequence.then(add(1));
    assert_eq!(extended.steps().len(), 5);
    // ((((1 + 1) * 2) + 2) * 2) + 1
    assert_eq!(extended.invoke(json!(1), None).await.unwrap(), json!(13));
}

#[test]
fn test_sequence_needs_two_steps() {
    assert!(matches!(
        RunnableSequence::new(vec![add(1).boxed()]),
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_steps_are_tagged_and_nested() {
    let collector = Arc::new(RunCollector::new());
    let sequence = add(1).pipe(double()).with_name("math");
    let config = RunnableConfig::new()
        .with_tag("outer")
        .with_handler(collector.clone());
    sequence.invoke(json!(1), Some(config)).await.unwrap();

    let trees = collector.trees();
    assert_eq!(trees.len(), 1);
    let root = &trees[0];
    assert_eq!(root.name, "math");
    assert_eq!(root.tags, vec!["outer"]);
    assert_eq!(root.child_runs.len(), 2);
    assert_eq!(root.child_runs[0].tags, vec!["outer", "seq:step:1"]);
    assert_eq!(root.child_runs[1].tags, vec!["outer", "seq:step:2"]);
    assert_eq!(root.child_runs[1].outputs, Some(json!(4)));
}

#[tokio::test]
async fn test_failing_step_stops_the_sequence() {
    let fail =
        RunnableLambda::new(|_: i64| async move { Err::<i64, _>(Error::other("step failed")) });
    let collector = Arc::new(RunCollector::new());
    let sequence = add(1).pipe(fail).then(double());
    let config = RunnableConfig::new().with_handler(collector.clone());

    let error = sequence.invoke(json!(1), Some(config)).await.unwrap_err();
    assert_eq!(error.to_string(), "step failed");
    // The root and the failing step; the last step never started.
    assert_eq!(collector.errored_runs().len(), 2);
    assert_eq!(collector.started_runs().len(), 3);
}

#[tokio::test]
async fn test_sequence_batch() {
    let sequence = add(1).pipe(double());
    let outputs = sequence
        .batch(vec![json!(0), json!(1), json!(2)], None)
        .await
        .unwrap();
    assert_eq!(outputs, vec![json!(2), json!(4), json!(6)]);
}

#[tokio::test]
async fn test_sequence_batch_with_exceptions_lets_survivors_finish() {
    let reject_big = RunnableLambda::new(|x: i64| async move {
        if x > 2 {
            Err(Error::other(format!("{x} is too big")))
        } else {
            Ok(x)
        }
    });
    let collector = Arc::new(RunCollector::new());
    let sequence = add(1).pipe(reject_big).then(double());
    let config = RunnableConfig::new().with_handler(collector.clone());

    let results = sequence
        .batch_with_exceptions(vec![json!(0), json!(1), json!(2), json!(3)], Some(config))
        .await;
    assert_eq!(*results[0].as_ref().unwrap(), json!(2));
    assert_eq!(*results[1].as_ref().unwrap(), json!(4));
    assert_eq!(results[2].as_ref().unwrap_err().to_string(), "3 is too big");
    assert_eq!(results[3].as_ref().unwrap_err().to_string(), "4 is too big");

    // One root run per item.
    assert_eq!(collector.runs_by_name("RunnableSequence").len(), 4);
}

#[tokio::test]
async fn test_sequence_batch_fail_fast() {
    let reject_big = RunnableLambda::new(|x: i64| async move {
        if x > 2 {
            Err(Error::other("too big"))
        } else {
            Ok(x)
        }
    });
    let sequence = add(1).pipe(reject_big);
    assert!(sequence.batch(vec![json!(0), json!(5)], None).await.is_err());
}

#[tokio::test]
async fn test_stream_through_transform_steps() {
    let sequence = RunnablePassthrough::new().pipe(RunnablePassthrough::new());
    assert!(sequence.supports_transform());

    let input = futures::stream::iter(vec![Ok(json!("a")), Ok(json!("b")), Ok(json!("c"))]).boxed();
    let chunks: Vec<Value> = sequence
        .transform(input, None)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn test_stream_stops_at_first_error() {
    let fail = RunnableLambda::new(|_: i64| async move { Err::<i64, _>(Error::other("nope")) });
    let sequence = add(1).pipe(fail);
    let chunks: Vec<_> = sequence.stream(json!(1), None).collect().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].as_ref().unwrap_err().to_string(), "nope");
}
