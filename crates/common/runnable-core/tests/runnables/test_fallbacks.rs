//! Tests for fallback runnables.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use runnable_core::error::{AbortReason, Error};
use runnable_core::language_models::FakeListChatModel;
use runnable_core::runnables::{
    ErrorClassifier, Runnable, RunnableConfig, RunnableLambda, RunnableWithFallbacks,
};
use runnable_core::tracers::RunCollector;

fn failing(message: &'static str) -> RunnableLambda<String, String> {
    RunnableLambda::new(move |_: String| async move { Err(Error::other(message)) })
}

fn answer(text: &'static str) -> RunnableLambda<String, String> {
    RunnableLambda::new(move |_: String| async move { Ok(text.to_string()) })
}

#[tokio::test]
async fn test_first_success_wins() {
    let runnable = failing("primary failed")
        .with_fallbacks(vec![answer("bar").into_dyn(), answer("baz").into_dyn()]);
    assert_eq!(runnable.invoke("foo".into(), None).await.unwrap(), "bar");
}

#[tokio::test]
async fn test_primary_success_skips_fallbacks() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = {
        let calls = calls.clone();
        RunnableLambda::new(move |x: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(x) }
        })
    };
    let runnable = answer("primary").with_fallbacks(vec![counted.into_dyn()]);
    assert_eq!(runnable.invoke("foo".into(), None).await.unwrap(), "primary");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_all_failing_returns_last_error() {
    let runnable = failing("one").with_fallbacks(vec![
        failing("two").into_dyn(),
        failing("three").into_dyn(),
    ]);
    let error = runnable.invoke("foo".into(), None).await.unwrap_err();
    assert_eq!(error.to_string(), "three");
}

#[tokio::test]
async fn test_fatal_errors_skip_fallbacks() {
    let aborted = RunnableLambda::new(|_: String| async move {
        Err::<String, _>(Error::Aborted(AbortReason::Cancelled))
    });
    let runnable = aborted.with_fallbacks(vec![answer("bar").into_dyn()]);
    assert!(matches!(
        runnable.invoke("foo".into(), None).await,
        Err(Error::Aborted(AbortReason::Cancelled))
    ));
}

#[tokio::test]
async fn test_classifier_limits_fallbacks() {
    let runnable = RunnableWithFallbacks::from_dyn()
        .runnable(failing("not transient").into_dyn())
        .fallbacks(vec![answer("bar").into_dyn()])
        .classifier(ErrorClassifier::Transient)
        .name("guarded")
        .call();
    assert_eq!(runnable.get_name(), "guarded");
    let error = runnable.invoke("foo".into(), None).await.unwrap_err();
    assert_eq!(error.to_string(), "not transient");
}

#[tokio::test]
async fn test_candidates_run_as_children() {
    let collector = Arc::new(RunCollector::new());
    let runnable = failing("primary failed")
        .with_fallbacks(vec![answer("bar").into_dyn()]);
    let config = RunnableConfig::new().with_handler(collector.clone());
    runnable.invoke("foo".into(), Some(config)).await.unwrap();

    let trees = collector.trees();
    assert_eq!(trees.len(), 1);
    let root = &trees[0];
    assert_eq!(root.child_runs.len(), 2);
    assert!(root.child_runs[0].error.is_some());
    assert_eq!(root.child_runs[1].outputs, Some(serde_json::json!("bar")));
}

#[tokio::test]
async fn test_stream_falls_back_before_first_chunk() {
    let broken = FakeListChatModel::new(vec!["never".into()]).with_error_on_chunk(0);
    let backup = FakeListChatModel::new(vec!["ok".into()]);
    let runnable = broken.with_fallbacks(vec![backup.into_dyn()]);

    let content: String = runnable
        .stream("hi".into(), None)
        .map(|chunk| chunk.unwrap().content)
        .collect::<Vec<_>>()
        .await
        .concat();
    assert_eq!(content, "ok");
}

#[tokio::test]
async fn test_stream_error_after_first_chunk_is_final() {
    let broken = FakeListChatModel::new(vec!["abc".into()]).with_error_on_chunk(1);
    let backup = FakeListChatModel::new(vec!["ok".into()]);
    let runnable = broken.with_fallbacks(vec![backup.into_dyn()]);

    let chunks: Vec<_> = runnable.stream("hi".into(), None).collect().await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].as_ref().unwrap().content, "a");
    assert!(chunks[1].is_err());
}
