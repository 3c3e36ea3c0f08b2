//! End-to-end pipelines built from the prompt, fake model and parser units.

use std::sync::Arc;

use futures::StreamExt;
use runnable_core::error::Error;
use runnable_core::language_models::FakeListChatModel;
use runnable_core::output_parsers::StrOutputParser;
use runnable_core::prompts::PromptTemplate;
use runnable_core::runnables::{Runnable, RunnableConfig, RunnableSequence};
use runnable_core::tracers::{RunCollector, RunType};
use serde_json::{Value, json};

fn joke_chain(responses: &[&str]) -> RunnableSequence {
    PromptTemplate::from_template("Tell me a joke about {subject}")
        .pipe(FakeListChatModel::new(
            responses.iter().map(|r| r.to_string()).collect(),
        ))
        .then(StrOutputParser::new())
}

#[tokio::test]
async fn test_prompt_model_parser() {
    let chain = joke_chain(&["hi"]);
    let output = chain.invoke(json!({"subject": "bears"}), None).await.unwrap();
    assert_eq!(output, json!("hi"));
}

#[tokio::test]
async fn test_pipeline_run_tree() {
    let collector = Arc::new(RunCollector::new());
    let chain = joke_chain(&["hi"]);
    let config = RunnableConfig::new().with_handler(collector.clone());
    chain.invoke(json!({"subject": "bears"}), Some(config)).await.unwrap();

    let trees = collector.trees();
    assert_eq!(trees.len(), 1);
    let root = &trees[0];
    let types: Vec<RunType> = root.child_runs.iter().map(|r| r.run_type).collect();
    assert_eq!(types, vec![RunType::Prompt, RunType::Llm, RunType::Parser]);

    let prompt = &root.child_runs[0];
    assert_eq!(prompt.outputs, Some(json!("Tell me a joke about bears")));
    for child in &root.child_runs {
        assert_eq!(child.parent_run_id, Some(root.id));
        assert_eq!(child.trace_id, root.id);
        assert!(child.dotted_order.starts_with(&root.dotted_order));
    }
}

#[tokio::test]
async fn test_pipeline_streams_tokens() {
    let collector = Arc::new(RunCollector::new());
    let chain = joke_chain(&["hello"]);
    let config = RunnableConfig::new().with_handler(collector.clone());

    let chunks: Vec<Value> = chain
        .stream(json!({"subject": "owls"}), Some(config))
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(
        chunks,
        vec![json!("h"), json!("e"), json!("l"), json!("l"), json!("o")]
    );

    let model_run = collector.runs_by_type(RunType::Llm).pop().unwrap();
    let tokens = model_run.events.iter().filter(|e| e.name == "new_token").count();
    assert_eq!(tokens, 5);

    let root = collector.runs_by_name("RunnableSequence").pop().unwrap();
    assert_eq!(root.outputs, Some(json!("hello")));
    assert_eq!(root.inputs, json!({"subject": "owls"}));
}

#[tokio::test]
async fn test_prompt_missing_variable() {
    let chain = joke_chain(&["hi"]);
    let error = chain.invoke(json!({"topic": "bears"}), None).await.unwrap_err();
    assert!(matches!(error, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_pipeline_batch_cycles_responses() {
    let chain = joke_chain(&["one", "two"]);
    let outputs = chain
        .batch(
            vec![json!({"subject": "a"}), json!({"subject": "b"})],
            Some(RunnableConfig::new().with_max_concurrency(1)),
        )
        .await
        .unwrap();
    assert_eq!(outputs, vec![json!("one"), json!("two")]);
}
