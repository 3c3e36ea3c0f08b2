//! Tests for abort signals and timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use runnable_core::callbacks::await_all_callbacks;
use runnable_core::error::{AbortReason, Error};
use runnable_core::language_models::FakeListChatModel;
use runnable_core::output_parsers::StrOutputParser;
use runnable_core::prompts::PromptTemplate;
use runnable_core::runnables::{Runnable, RunnableConfig, RunnableLambda};
use runnable_core::signal::AbortSignal;
use runnable_core::tracers::{RunCollector, RunType};
use serde_json::{Value, json};
use serial_test::serial;

fn sleepy(duration: Duration) -> RunnableLambda<i64, i64> {
    RunnableLambda::new(move |x: i64| async move {
        tokio::time::sleep(duration).await;
        Ok(x)
    })
}

fn abort_after(signal: &AbortSignal, after: Duration) {
    let signal = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        signal.abort();
    });
}

#[test]
fn test_abort_is_idempotent() {
    let signal = AbortSignal::new();
    assert!(!signal.is_aborted());
    assert!(signal.reason().is_none());

    signal.abort();
    signal.abort();
    signal.abort_with(AbortReason::Timeout(Duration::from_secs(1)));

    assert!(signal.is_aborted());
    assert_eq!(signal.reason(), Some(AbortReason::Cancelled));
    assert!(matches!(signal.check(), Err(Error::Aborted(AbortReason::Cancelled))));
}

#[tokio::test]
async fn test_already_aborted_signal_fails_without_running() {
    let signal = AbortSignal::new();
    signal.abort();
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new()
        .with_signal(signal)
        .with_handler(collector.clone());

    let result = sleepy(Duration::from_secs(10)).invoke(1, Some(config)).await;
    assert!(matches!(result, Err(Error::Aborted(AbortReason::Cancelled))));
    assert_eq!(collector.errored_runs().len(), 1);
}

#[tokio::test]
async fn test_abort_mid_run() {
    let signal = AbortSignal::new();
    abort_after(&signal, Duration::from_millis(30));

    let started = Instant::now();
    let result = sleepy(Duration::from_secs(10))
        .invoke(1, Some(RunnableConfig::new().with_signal(signal)))
        .await;
    assert!(matches!(result, Err(Error::Aborted(AbortReason::Cancelled))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_timeout() {
    let config = RunnableConfig::new().with_timeout(Duration::from_millis(30));
    let result = sleepy(Duration::from_secs(10)).invoke(1, Some(config)).await;
    match result {
        Err(Error::Aborted(AbortReason::Timeout(after))) => {
            assert_eq!(after, Duration::from_millis(30));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_outer_timeout_is_reported_through_call_timeout() {
    let config = RunnableConfig::new()
        .with_signal(AbortSignal::timeout(Duration::from_millis(30)))
        .with_timeout(Duration::from_secs(10));
    let result = sleepy(Duration::from_secs(10)).invoke(1, Some(config)).await;
    assert!(matches!(
        result,
        Err(Error::Aborted(AbortReason::Timeout(after))) if after == Duration::from_millis(30)
    ));
}

#[tokio::test]
async fn test_fast_run_beats_timeout() {
    let config = RunnableConfig::new().with_timeout(Duration::from_secs(5));
    let result = sleepy(Duration::from_millis(1)).invoke(7, Some(config)).await;
    assert_eq!(result.unwrap(), 7);
}

#[tokio::test]
async fn test_abort_reaches_nested_runs() {
    let inner = sleepy(Duration::from_secs(10)).into_dyn();
    let outer = RunnableLambda::new(move |x: i64| {
        let inner = inner.clone();
        async move { inner.invoke(x, None).await }
    });
    let collector = Arc::new(RunCollector::new());
    let signal = AbortSignal::new();
    abort_after(&signal, Duration::from_millis(30));
    let config = RunnableConfig::new()
        .with_signal(signal)
        .with_handler(collector.clone());

    let result = outer.invoke(1, Some(config)).await;
    assert!(matches!(result, Err(Error::Aborted(_))));
    let started = collector.started_runs().len();
    assert_eq!(started, 2);
}

#[tokio::test]
async fn test_abort_mid_stream() {
    let model =
        FakeListChatModel::new(vec!["abcdefghij".into()]).with_sleep(Duration::from_millis(20));
    let signal = AbortSignal::new();
    let config = RunnableConfig::new().with_signal(signal.clone());

    let mut stream = model.stream("hi".into(), Some(config));
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "a");

    signal.abort();
    let next = stream.next().await.unwrap();
    assert!(matches!(next, Err(Error::Aborted(AbortReason::Cancelled))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_batch_abort_fails_every_item() {
    let signal = AbortSignal::new();
    abort_after(&signal, Duration::from_millis(30));
    let results = sleepy(Duration::from_secs(10))
        .batch_with_exceptions(vec![1, 2, 3], Some(RunnableConfig::new().with_signal(signal)))
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| matches!(r, Err(Error::Aborted(_)))));
}

#[tokio::test]
#[serial]
async fn test_dropping_a_stream_ends_its_open_runs() {
    let collector = Arc::new(RunCollector::new());
    let chain = PromptTemplate::from_template("Spell {word}")
        .pipe(
            FakeListChatModel::new(vec!["abcdefghij".into()])
                .with_sleep(Duration::from_millis(20)),
        )
        .then(StrOutputParser::new());
    let config = RunnableConfig::new().with_handler(collector.clone());

    let mut stream = chain.stream(json!({"word": "letters"}), Some(config));
    let mut received = Vec::new();
    while received.len() < 2 {
        received.push(stream.next().await.unwrap().unwrap());
    }
    drop(stream);
    assert_eq!(received, vec![json!("a"), json!("b")]);

    await_all_callbacks().await;

    assert_eq!(collector.started_runs().len(), 4);
    assert_eq!(collector.len(), 4);

    let dropped = Error::Aborted(AbortReason::Dropped).to_string();
    let errored = collector.errored_runs();
    assert_eq!(errored.len(), 3);
    assert!(errored.iter().all(|run| run.error.as_deref() == Some(dropped.as_str())));
    assert!(errored.iter().all(|run| run.outputs.is_none() && run.end_time.is_some()));

    let model_run = collector.runs_by_type(RunType::Llm).pop().unwrap();
    assert_eq!(model_run.error.as_deref(), Some(dropped.as_str()));
    let tokens = model_run.events.iter().filter(|e| e.name == "new_token").count();
    assert_eq!(tokens, 2);

    let prompt_run = collector.runs_by_type(RunType::Prompt).pop().unwrap();
    assert!(prompt_run.error.is_none());
    assert_eq!(prompt_run.outputs, Some(Value::from("Spell letters")));
}
