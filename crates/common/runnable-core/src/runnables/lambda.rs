use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::Result;

use super::base::{Runnable, RunnableValue, call_with_config};
use super::config::RunnableConfig;

type LambdaFn<I, O> = Arc<dyn Fn(I, RunnableConfig) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// An async function as a runnable.
///
/// The function runs inside its own run, so runnables it invokes without an
/// explicit config are traced as its children.
pub struct RunnableLambda<I, O> {
    func: LambdaFn<I, O>,
    name: Option<String>,
}

impl<I, O> Debug for RunnableLambda<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableLambda")
            .field("name", &self.name)
            .finish()
    }
}

impl<I, O> Clone for RunnableLambda<I, O> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            name: self.name.clone(),
        }
    }
}

impl<I, O> RunnableLambda<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, _config| func(input).boxed()),
            name: None,
        }
    }

    /// A function that also receives the config for calls it makes.
    pub fn new_with_config<F, Fut>(func: F) -> Self
    where
        F: Fn(I, RunnableConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, config| func(input, config).boxed()),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl<I, O> Runnable for RunnableLambda<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> Option<String> {
        Some(self.name.clone().unwrap_or_else(|| "RunnableLambda".to_string()))
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        call_with_config(self, input, config, |input, run| {
            (self.func)(input, run.child_config(None).without_kwargs())
        })
        .await
    }
}
