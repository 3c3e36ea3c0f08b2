//! Tests for parallel maps, assignment and key picking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use runnable_core::error::Error;
use runnable_core::runnables::{
    Runnable, RunnableConfig, RunnableLambda, RunnableParallel, RunnablePassthrough,
};
use runnable_core::tracers::RunCollector;
use serde_json::{Map, Value, json};

#[tokio::test]
async fn test_parallel_runs_every_branch_on_the_same_input() {
    let parallel = RunnableParallel::new()
        .add_fn("plus", |x: Value| async move { Ok(json!(x.as_i64().unwrap_or(0) + 1)) })
        .add_fn("times", |x: Value| async move { Ok(json!(x.as_i64().unwrap_or(0) * 10)) })
        .add("same", RunnablePassthrough::new());

    let output = parallel.invoke(json!(4), None).await.unwrap();
    assert_eq!(output, json!({"plus": 5, "times": 40, "same": 4}));
    assert_eq!(parallel.get_name(), "RunnableParallel<plus,times,same>");
}

#[tokio::test]
async fn test_first_failure_wins() {
    let slow_finished = Arc::new(AtomicBool::new(false));
    let parallel = {
        let slow_finished = slow_finished.clone();
        RunnableParallel::new()
            .add_fn("slow", move |x: Value| {
                let slow_finished = slow_finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    slow_finished.store(true, Ordering::SeqCst);
                    Ok(x)
                }
            })
            .add_fn("fast", |_: Value| async move { Err::<Value, _>(Error::other("fast failed")) })
    };

    let started = Instant::now();
    let error = parallel.invoke(json!(1), None).await.unwrap_err();
    assert_eq!(error.to_string(), "fast failed");
    assert!(started.elapsed() < Duration::from_millis(400));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!slow_finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_branches_are_tagged_by_key() {
    let collector = Arc::new(RunCollector::new());
    let parallel = RunnableParallel::new()
        .add_fn("a", |x: Value| async move { Ok(x) })
        .add_fn("b", |x: Value| async move { Ok(x) });
    let config = RunnableConfig::new().with_handler(collector.clone());
    parallel.invoke(json!(null), Some(config)).await.unwrap();

    let trees = collector.trees();
    assert_eq!(trees.len(), 1);
    let mut tags: Vec<Vec<String>> = trees[0].child_runs.iter().map(|r| r.tags.clone()).collect();
    tags.sort();
    assert_eq!(tags, vec![vec!["map:key:a"], vec!["map:key:b"]]);
}

#[tokio::test]
async fn test_parallel_stream_emits_keyed_chunks() {
    let parallel = RunnableParallel::new()
        .add("left", RunnablePassthrough::new())
        .add("right", RunnablePassthrough::new());

    let input = futures::stream::iter(vec![Ok(json!("x")), Ok(json!("y"))]).boxed();
    let chunks: Vec<Value> = parallel
        .transform(input, None)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(chunks.len(), 4);
    let mut left = Vec::new();
    let mut right = Vec::new();
    for chunk in chunks {
        let object: Map<String, Value> = serde_json::from_value(chunk).unwrap();
        assert_eq!(object.len(), 1);
        if let Some(v) = object.get("left") {
            left.push(v.clone());
        }
        if let Some(v) = object.get("right") {
            right.push(v.clone());
        }
    }
    assert_eq!(left, vec![json!("x"), json!("y")]);
    assert_eq!(right, vec![json!("x"), json!("y")]);
}

#[tokio::test]
async fn test_assign_adds_keys_to_input() {
    let chain = RunnablePassthrough::assign()
        .add_fn("length", |x: Value| async move {
            Ok(json!(x["text"].as_str().map(str::len).unwrap_or(0)))
        })
        .build()
        .pipe(RunnablePassthrough::pick(["text", "length"]));

    let output = chain.invoke(json!({"text": "hello", "other": 1}), None).await.unwrap();
    assert_eq!(output, json!({"text": "hello", "length": 5}));
}

#[tokio::test]
async fn test_assign_stream_yields_input_then_assigned_keys() {
    let assign = RunnablePassthrough::assign()
        .add_fn("upper", |x: Value| async move {
            Ok(json!(x["word"].as_str().unwrap_or_default().to_uppercase()))
        })
        .build();

    let chunks: Vec<Value> = assign
        .stream(json!({"word": "hi"}), None)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![json!({"word": "hi"}), json!({"upper": "HI"})]);
}
