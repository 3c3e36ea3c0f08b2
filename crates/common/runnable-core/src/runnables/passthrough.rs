//! Identity, assignment and key selection over JSON objects.

use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::base::{Runnable, call_with_config, once_stream, transform_stream_with_config};
use super::config::RunnableConfig;
use super::parallel::RunnableParallel;
use super::utils::ChunkAggregator;

/// Passes its input through unchanged.
///
/// Chunks are forwarded as they arrive, so placing a passthrough inside a
/// streaming sequence adds no buffering.
#[derive(Debug, Clone, Default)]
pub struct RunnablePassthrough {
    name: Option<String>,
}

impl RunnablePassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Start building a [`RunnableAssign`].
    pub fn assign() -> RunnableAssignBuilder {
        RunnableAssignBuilder::new()
    }

    /// Select keys from an object input. One key yields its value, several
    /// keys yield an object.
    pub fn pick(keys: impl IntoIterator<Item = impl Into<String>>) -> RunnablePick {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.len() == 1 {
            RunnablePick::new_single(keys.remove(0))
        } else {
            RunnablePick::new_multi(keys)
        }
    }
}

#[async_trait]
impl Runnable for RunnablePassthrough {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn supports_transform(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        call_with_config(self, input, config, |input, _run| async move { Ok(input) }).await
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
        transform_stream_with_config(self, input, config, |input, _run| input)
    }
}

/// Builder for [`RunnableAssign`]. Use [`RunnablePassthrough::assign`].
#[derive(Debug, Default)]
pub struct RunnableAssignBuilder {
    mapper: RunnableParallel,
}

impl RunnableAssignBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn add<R>(mut self, key: impl Into<String>, runnable: R) -> Self
    where
        R: Runnable + 'static,
    {
        self.mapper = self.mapper.add(key, runnable);
        self
    }

    pub fn add_fn<F, Fut>(mut self, key: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.mapper = self.mapper.add_fn(key, func);
        self
    }

    pub fn build(self) -> RunnableAssign {
        RunnableAssign::new(self.mapper)
    }
}

/// Merges the output of a map into its object input.
///
/// Keys produced by the map overwrite input keys of the same name.
#[derive(Debug)]
pub struct RunnableAssign {
    mapper: RunnableParallel,
    name: Option<String>,
}

fn expect_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(object) => Ok(object),
        other => Err(Error::invalid_input(format!(
            "RunnableAssign expects an object input, got {other}"
        ))),
    }
}

impl RunnableAssign {
    pub fn new(mapper: RunnableParallel) -> Self {
        Self { mapper, name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn mapper(&self) -> &RunnableParallel {
        &self.mapper
    }
}

#[async_trait]
impl Runnable for RunnableAssign {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| Some("RunnableAssign".to_string()))
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        call_with_config(self, input, config, |input, run| async move {
            let mut object = expect_object(input.clone())?;
            let config = run.child_config(None).without_kwargs();
            let mapped = expect_object(self.mapper.invoke(input, Some(config)).await?)?;
            object.extend(mapped);
            Ok(Value::Object(object))
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

    /// Yields the input object (without the keys the map will assign) once
    /// the input is complete, then the map's keyed chunks as they arrive.
    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Value>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        transform_stream_with_config(self, input, config, move |mut input, run| {
            Box::pin(async_stream::stream! {
                let mut aggregator = ChunkAggregator::new();
                while let Some(chunk) = input.next().await {
                    match chunk {
                        Ok(chunk) => aggregator.push(chunk),
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                let mut object = match expect_object(aggregator.finish()) {
                    Ok(object) => object,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                let full = Value::Object(object.clone());
                object.retain(|key, _| !self.mapper.steps().contains_key(key));
                if !object.is_empty() {
                    yield Ok(Value::Object(object));
                }

                let config = run.child_config(None).without_kwargs();
                let mut mapped = self.mapper.stream(full, Some(config));
                while let Some(chunk) = mapped.next().await {
                    yield chunk;
                }
            })
        })
    }
}

/// Keys selected by a [`RunnablePick`].
#[derive(Debug, Clone)]
pub enum PickKeys {
    Single(String),
    Multiple(Vec<String>),
}

/// Selects keys from an object input.
#[derive(Debug, Clone)]
pub struct RunnablePick {
    keys: PickKeys,
    name: Option<String>,
}

impl RunnablePick {
    pub fn new_single(key: impl Into<String>) -> Self {
        Self {
            keys: PickKeys::Single(key.into()),
            name: None,
        }
    }

    pub fn new_multi(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: PickKeys::Multiple(keys.into_iter().map(Into::into).collect()),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn pick(&self, input: &Value) -> Option<Value> {
        match &self.keys {
            PickKeys::Single(key) => input.get(key).cloned(),
            PickKeys::Multiple(keys) => {
                let picked: Map<String, Value> = keys
                    .iter()
                    .filter_map(|k| input.get(k).map(|v| (k.clone(), v.clone())))
                    .collect();
                (!picked.is_empty()).then_some(Value::Object(picked))
            }
        }
    }
}

#[async_trait]
impl Runnable for RunnablePick {
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            let keys = match &self.keys {
                PickKeys::Single(k) => k.clone(),
                PickKeys::Multiple(keys) => keys.join(","),
            };
            Some(format!("RunnablePick<{keys}>"))
        })
    }

    fn supports_transform(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        call_with_config(self, input, config, |input, _run| async move {
            Ok(self.pick(&input).unwrap_or(Value::Null))
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

    /// Chunks from which nothing can be picked are skipped.
    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Value>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        transform_stream_with_config(self, input, config, move |input, _run| {
            input
                .filter_map(move |chunk| async move {
                    match chunk {
                        Ok(chunk) => self.pick(&chunk).map(Ok),
                        Err(error) => Some(Err(error)),
                    }
                })
                .boxed()
        })
    }
}
