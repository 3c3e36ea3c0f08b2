//! Concurrent fan-out over named branches.

use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::Result;

use super::base::{
    DEFAULT_MAX_CONCURRENCY, DynRunnable, Runnable, call_with_config, once_stream,
    transform_stream_with_config,
};
use super::config::RunnableConfig;
use super::lambda::RunnableLambda;
use super::utils::try_gather_with_concurrency;

/// Runs named branches concurrently on the same input.
///
/// The output is an object keyed by branch name. The first branch to fail
/// decides the result; branches still running are dropped.
#[derive(Clone)]
pub struct RunnableParallel {
    steps: IndexMap<String, DynRunnable<Value, Value>>,
    name: Option<String>,
}

impl Debug for RunnableParallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableParallel")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("name", &self.name)
            .finish()
    }
}

impl Default for RunnableParallel {
    fn default() -> Self {
        Self::new()
    }
}

fn branch_tag(key: &str) -> String {
    format!("map:key:{key}")
}

fn keyed(key: &str, chunk: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), chunk);
    Value::Object(object)
}

enum Next {
    Input(Option<Result<Value>>),
    Output(Option<Result<Value>>),
}

impl RunnableParallel {
    pub fn new() -> Self {
        Self {
            steps: IndexMap::new(),
            name: None,
        }
    }

    /// Add a branch.
    pub fn add<R>(mut self, key: impl Into<String>, runnable: R) -> Self
    where
        R: Runnable + 'static,
    {
        self.steps.insert(key.into(), runnable.boxed());
        self
    }

    /// Add a branch from an async function over JSON values.
    pub fn add_fn<F, Fut>(self, key: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.add(key, RunnableLambda::new(func))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn steps(&self) -> &IndexMap<String, DynRunnable<Value, Value>> {
        &self.steps
    }
}

impl From<IndexMap<String, DynRunnable<Value, Value>>> for RunnableParallel {
    fn from(steps: IndexMap<String, DynRunnable<Value, Value>>) -> Self {
        Self { steps, name: None }
    }
}

#[async_trait]
impl Runnable for RunnableParallel {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            Some(format!(
                "RunnableParallel<{}>",
                self.steps.keys().cloned().collect::<Vec<_>>().join(",")
            ))
        })
    }

    fn supports_transform(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        call_with_config(self, input, config, |input, run| async move {
            let limit = run
                .config()
                .max_concurrency
                .unwrap_or(DEFAULT_MAX_CONCURRENCY);
            let futures: Vec<_> = self
                .steps
                .iter()
                .map(|(key, step)| {
                    let config = run.child_config(Some(&branch_tag(key))).without_kwargs();
                    let input = input.clone();
                    async move {
                        let output = step.invoke(input, Some(config)).await?;
                        Ok((key.clone(), output))
                    }
                })
                .collect();
            let outputs = try_gather_with_concurrency(limit, futures).await?;
            Ok(Value::Object(outputs.into_iter().collect()))
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Value,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        self.transform(once_stream(input), config)
    }

    /// Each input chunk is copied to every branch as it arrives. Branch
    /// output chunks are emitted as `{key: chunk}` in arrival order.
    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Value>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        transform_stream_with_config(self, input, config, move |input, run| {
            let mut senders = Vec::with_capacity(self.steps.len());
            let mut branches = Vec::with_capacity(self.steps.len());
            for (key, step) in &self.steps {
                let (tx, rx) = mpsc::unbounded::<Result<Value>>();
                senders.push(tx);
                let config = run.child_config(Some(&branch_tag(key))).without_kwargs();
                let key = key.clone();
                branches.push(
                    step.transform(rx.boxed(), Some(config))
                        .map(move |chunk| chunk.map(|c| keyed(&key, c)))
                        .boxed(),
                );
            }

            Box::pin(async_stream::stream! {
                let mut input = input.fuse();
                let mut outputs = stream::select_all(branches);
                let mut input_done = false;
                loop {
                    let next = tokio::select! {
                        chunk = input.next(), if !input_done => Next::Input(chunk),
                        chunk = outputs.next() => Next::Output(chunk),
                    };
                    match next {
                        Next::Input(Some(Ok(chunk))) => {
                            for tx in &senders {
                                let _ = tx.unbounded_send(Ok(chunk.clone()));
                            }
                        }
                        Next::Input(Some(Err(error))) | Next::Output(Some(Err(error))) => {
                            yield Err(error);
                            return;
                        }
                        Next::Input(None) => {
                            input_done = true;
                            senders.clear();
                        }
                        Next::Output(Some(Ok(chunk))) => yield Ok(chunk),
                        Next::Output(None) => break,
                    }
                }
            })
        })
    }
}
