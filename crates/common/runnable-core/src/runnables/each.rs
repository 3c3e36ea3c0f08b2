use async_trait::async_trait;

use crate::error::Result;

use super::base::{Runnable, call_with_config};
use super::config::RunnableConfig;

/// Applies a runnable to every element of a list input.
///
/// Elements are processed with the wrapped runnable's `batch`, so they share
/// its concurrency limit and fail-fast behavior.
#[derive(Debug)]
pub struct RunnableEach<R> {
    bound: R,
}

impl<R> RunnableEach<R>
where
    R: Runnable,
{
    pub fn new(bound: R) -> Self {
        Self { bound }
    }

    pub fn bound(&self) -> &R {
        &self.bound
    }
}

#[async_trait]
impl<R> Runnable for RunnableEach<R>
where
    R: Runnable,
{
    type Input = Vec<R::Input>;
    type Output = Vec<R::Output>;

    fn name(&self) -> Option<String> {
        Some(format!("RunnableEach<{}>", self.bound.get_name()))
    }

    async fn invoke(
        &self,
        inputs: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<Self::Output> {
        call_with_config(self, inputs, config, |inputs, run| async move {
            self.bound.batch(inputs, Some(run.child_config(None))).await
        })
        .await
    }
}
