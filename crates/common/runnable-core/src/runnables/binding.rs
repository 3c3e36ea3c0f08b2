use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::Result;
use crate::tracers::root_listeners::{Listeners, RootListenersTracer};
use crate::tracers::schemas::RunType;

use super::base::Runnable;
use super::config::{RunnableConfig, merge_configs};

/// A runnable with pre-bound keyword arguments and config.
///
/// Binding never changes the wrapped runnable. Binding a binding again
/// merges into the same wrapper (later keys win), so
/// `r.bind(a).bind(b)` behaves exactly like `r.bind(a ∪ b)`.
#[derive(Debug)]
pub struct RunnableBinding<R> {
    bound: R,
    kwargs: IndexMap<String, Value>,
    config: RunnableConfig,
    listeners: Vec<Listeners>,
}

impl<R> RunnableBinding<R>
where
    R: Runnable,
{
    pub fn new(bound: R) -> Self {
        Self {
            bound,
            kwargs: IndexMap::new(),
            config: RunnableConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn bound(&self) -> &R {
        &self.bound
    }

    pub fn kwargs(&self) -> &IndexMap<String, Value> {
        &self.kwargs
    }

    pub fn config(&self) -> &RunnableConfig {
        &self.config
    }

    pub fn with_kwargs(mut self, kwargs: IndexMap<String, Value>) -> Self {
        self.kwargs.extend(kwargs);
        self
    }

    pub fn with_bound_config(mut self, config: RunnableConfig) -> Self {
        self.config = merge_configs(vec![Some(self.config), Some(config)]);
        self
    }

    /// Bind more keyword arguments onto this binding.
    pub fn bind(self, kwargs: IndexMap<String, Value>) -> Self {
        self.with_kwargs(kwargs)
    }

    /// Bind more config onto this binding.
    pub fn with_config(self, config: RunnableConfig) -> Self {
        self.with_bound_config(config)
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners.push(listeners);
        self
    }

    fn merged_config(&self, config: Option<RunnableConfig>) -> RunnableConfig {
        let mut config = merge_configs(vec![Some(self.config.clone()), config]);
        config.kwargs.extend(self.kwargs.clone());
        for listeners in &self.listeners {
            config = config.with_handler(Arc::new(RootListenersTracer::new(listeners.clone())));
        }
        config
    }
}

#[async_trait]
impl<R> Runnable for RunnableBinding<R>
where
    R: Runnable,
{
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> Option<String> {
        self.bound.name()
    }

    fn get_name(&self) -> String {
        self.bound.get_name()
    }

    fn run_type(&self) -> RunType {
        self.bound.run_type()
    }

    fn supports_transform(&self) -> bool {
        self.bound.supports_transform()
    }

    async fn invoke(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<Self::Output> {
        self.bound.invoke(input, Some(self.merged_config(config))).await
    }

    async fn batch(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Self::Output>> {
        self.bound.batch(inputs, Some(self.merged_config(config))).await
    }

    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Self::Output>> {
        self.bound
            .batch_with_exceptions(inputs, Some(self.merged_config(config)))
            .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        self.bound.stream(input, Some(self.merged_config(config)))
    }

    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Self::Input>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        self.bound.transform(input, Some(self.merged_config(config)))
    }
}
