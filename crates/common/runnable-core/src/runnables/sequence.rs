//! Sequential composition of runnables.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::{Error, Result};

use super::base::{
    ActiveRun, DEFAULT_MAX_CONCURRENCY, DynRunnable, Runnable, call_with_config, once_stream,
    transform_stream_with_config,
};
use super::config::{RunnableConfig, get_config_list};
use super::utils::{gather_with_concurrency, try_gather_with_concurrency};

/// A pipeline: the output of each step is the input of the next.
///
/// Steps are erased to JSON, so any two runnables whose output and input
/// serialize compatibly can be chained. Nested sequences at either end are
/// spliced in, so `(a | b) | (c | d)` has the four steps `a, b, c, d`.
///
/// Streaming is lazy end to end: each step's `transform` consumes the
/// previous step's output stream. Steps that cannot transform buffer their
/// input, so a chunk only reaches the end of the pipeline once every
/// buffering step before it has finished.
#[derive(Debug, Clone)]
pub struct RunnableSequence {
    steps: Vec<DynRunnable<Value, Value>>,
    name: Option<String>,
}

fn flatten(step: DynRunnable<Value, Value>) -> Vec<DynRunnable<Value, Value>> {
    match step.sequence_steps() {
        Some(steps) => steps,
        None => vec![step],
    }
}

fn step_tag(index: usize) -> String {
    format!("seq:step:{}", index + 1)
}

impl RunnableSequence {
    /// Build a sequence from at least two steps.
    pub fn new(steps: Vec<DynRunnable<Value, Value>>) -> Result<Self> {
        let count = steps.len();
        let mut flat = Vec::with_capacity(count);
        for (index, step) in steps.into_iter().enumerate() {
            if index == 0 || index + 1 == count {
                flat.extend(flatten(step));
            } else {
                flat.push(step);
            }
        }
        if flat.len() < 2 {
            return Err(Error::invalid_input(
                "RunnableSequence must have at least 2 steps",
            ));
        }
        Ok(Self {
            steps: flat,
            name: None,
        })
    }

    /// Chain two runnables.
    pub fn pair(first: DynRunnable<Value, Value>, last: DynRunnable<Value, Value>) -> Self {
        let mut steps = flatten(first);
        steps.extend(flatten(last));
        Self { steps, name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn steps(&self) -> &[DynRunnable<Value, Value>] {
        &self.steps
    }

    pub fn first(&self) -> &DynRunnable<Value, Value> {
        &self.steps[0]
    }

    pub fn last(&self) -> &DynRunnable<Value, Value> {
        &self.steps[self.steps.len() - 1]
    }

    /// Append another step.
    pub fn then<R>(self, next: R) -> Self
    where
        R: Runnable + 'static,
    {
        Self::pair(std::sync::Arc::new(self), next.boxed())
    }

    /// Run every item through the steps, one step at a time.
    ///
    /// With `fail_fast` the first error aborts the whole batch and is
    /// returned; otherwise a failed item drops out and keeps its error while
    /// the others continue.
    async fn batch_steps(
        &self,
        inputs: Vec<Value>,
        config: Option<RunnableConfig>,
        fail_fast: bool,
    ) -> Result<Vec<Result<Value>>> {
        let configs = get_config_list(config, inputs.len());
        let limit = configs
            .first()
            .and_then(|c| c.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);

        let mut results: Vec<Option<Result<Value>>> = inputs.iter().map(|_| None).collect();
        let mut live: Vec<(usize, ActiveRun, Value)> = Vec::with_capacity(inputs.len());
        for (index, (input, config)) in inputs.into_iter().zip(configs).enumerate() {
            match ActiveRun::start(self, input.clone(), config).await {
                Ok(run) => live.push((index, run, input)),
                Err(error) if fail_fast => {
                    for (_, run, _) in live {
                        run.fail(&error).await;
                    }
                    return Err(error);
                }
                Err(error) => results[index] = Some(Err(error)),
            }
        }

        for (step_index, step) in self.steps.iter().enumerate() {
            let tag = step_tag(step_index);
            let futures: Vec<_> = live
                .iter_mut()
                .map(|(_, run, value)| {
                    let input = std::mem::take(value);
                    let config = run.handle().child_config(Some(&tag)).without_kwargs();
                    run.scoped(step.invoke(input, Some(config)))
                })
                .collect();

            if fail_fast {
                match try_gather_with_concurrency(limit, futures).await {
                    Ok(outputs) => {
                        for ((_, _, value), output) in live.iter_mut().zip(outputs) {
                            *value = output;
                        }
                    }
                    Err(error) => {
                        for (_, run, _) in live {
                            run.fail(&error).await;
                        }
                        return Err(error);
                    }
                }
            } else {
                let outputs = gather_with_concurrency(limit, futures).await;
                let mut survivors = Vec::with_capacity(live.len());
                for ((index, run, _), output) in live.into_iter().zip(outputs) {
                    match output {
                        Ok(value) => survivors.push((index, run, value)),
                        Err(error) => {
                            run.fail(&error).await;
                            results[index] = Some(Err(error));
                        }
                    }
                }
                live = survivors;
            }
        }

        for (index, run, value) in live {
            let result = Ok(value);
            run.finish(&result).await;
            results[index] = Some(result);
        }
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::other("No result for batch item"))))
            .collect())
    }
}

#[async_trait]
impl Runnable for RunnableSequence {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn supports_transform(&self) -> bool {
        self.steps.iter().all(|step| step.supports_transform())
    }

    fn sequence_steps(&self) -> Option<Vec<DynRunnable<Value, Value>>> {
        Some(self.steps.clone())
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        call_with_config(self, input, config, |input, run| async move {
            let mut value = input;
            for (index, step) in self.steps.iter().enumerate() {
                let config = run.child_config(Some(&step_tag(index))).without_kwargs();
                value = step.invoke(value, Some(config)).await?;
            }
            Ok(value)
        })
        .await
    }

    async fn batch(
        &self,
        inputs: Vec<Value>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Value>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        self.batch_steps(inputs, config, true)
            .await?
            .into_iter()
            .collect()
    }

    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Value>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Value>> {
        let count = inputs.len();
        if count == 0 {
            return Vec::new();
        }
        match self.batch_steps(inputs, config, false).await {
            Ok(results) => results,
            Err(error) => {
                let message = error.to_string();
                std::iter::once(Err(error))
                    .chain((1..count).map(|_| Err(Error::other(message.clone()))))
                    .collect()
            }
        }
    }

    fn stream<'a>(
        &'a self,
        input: Value,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        self.transform(once_stream(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Value>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        transform_stream_with_config(self, input, config, move |input, run| {
            let mut stream = input;
            for (index, step) in self.steps.iter().enumerate() {
                let config = run.child_config(Some(&step_tag(index))).without_kwargs();
                stream = step.transform(stream, Some(config));
            }
            stream
        })
    }
}
