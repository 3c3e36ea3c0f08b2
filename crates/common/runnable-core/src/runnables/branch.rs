use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{Error, Result};

use super::base::{
    DynRunnable, RunHandle, Runnable, RunnableValue, call_with_config, once_stream,
    transform_stream_with_config,
};
use super::config::RunnableConfig;
use super::lambda::RunnableLambda;

/// Routes its input to the first branch whose condition holds.
///
/// Conditions are evaluated in order, each in its own child run tagged
/// `condition:<n>`. The chosen branch runs tagged `branch:<n>`, or
/// `branch:default` when no condition matched.
pub struct RunnableBranch<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    branches: Vec<(DynRunnable<I, bool>, DynRunnable<I, O>)>,
    default: DynRunnable<I, O>,
    name: Option<String>,
}

impl<I, O> Debug for RunnableBranch<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableBranch")
            .field("branches_count", &self.branches.len())
            .field("name", &self.name)
            .finish()
    }
}

#[bon::bon]
impl<I, O> RunnableBranch<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    #[builder]
    pub fn new(
        branches: Vec<(DynRunnable<I, bool>, DynRunnable<I, O>)>,
        default: DynRunnable<I, O>,
        #[builder(into)] name: Option<String>,
    ) -> Result<Self> {
        if branches.is_empty() {
            return Err(Error::InvalidConfig(
                "RunnableBranch requires at least one condition branch".to_string(),
            ));
        }

        Ok(Self {
            branches,
            default,
            name,
        })
    }

    /// Index of the first branch whose condition holds.
    async fn select(&self, input: &I, run: &RunHandle) -> Result<Option<usize>> {
        for (index, (condition, _)) in self.branches.iter().enumerate() {
            let tag = format!("condition:{}", index + 1);
            let config = run.child_config(Some(&tag)).without_kwargs();
            if condition.invoke(input.clone(), Some(config)).await? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn chosen(&self, selected: Option<usize>) -> (&DynRunnable<I, O>, String) {
        match selected.and_then(|index| self.branches.get(index).map(|b| (index, b))) {
            Some((index, (_, runnable))) => (runnable, format!("branch:{}", index + 1)),
            None => (&self.default, "branch:default".to_string()),
        }
    }
}

/// Fluent construction from async closures.
pub struct RunnableBranchFluentBuilder<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    branches: Vec<(DynRunnable<I, bool>, DynRunnable<I, O>)>,
}

impl<I, O> RunnableBranchFluentBuilder<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
        }
    }

    pub fn branch<CF, CFut, RF, RFut>(mut self, condition: CF, runnable: RF) -> Self
    where
        CF: Fn(I) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<bool>> + Send + 'static,
        RF: Fn(I) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<O>> + Send + 'static,
    {
        self.branches.push((
            Arc::new(RunnableLambda::new(condition)),
            Arc::new(RunnableLambda::new(runnable)),
        ));
        self
    }

    pub fn branch_arc(
        mut self,
        condition: DynRunnable<I, bool>,
        runnable: DynRunnable<I, O>,
    ) -> Self {
        self.branches.push((condition, runnable));
        self
    }

    pub fn default<DF, DFut>(self, default_fn: DF) -> Result<RunnableBranch<I, O>>
    where
        DF: Fn(I) -> DFut + Send + Sync + 'static,
        DFut: Future<Output = Result<O>> + Send + 'static,
    {
        self.default_arc(Arc::new(RunnableLambda::new(default_fn)))
    }

    pub fn default_arc(self, default: DynRunnable<I, O>) -> Result<RunnableBranch<I, O>> {
        RunnableBranch::builder()
            .branches(self.branches)
            .default(default)
            .build()
    }
}

impl<I, O> Default for RunnableBranchFluentBuilder<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<I, O> Runnable for RunnableBranch<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| Some("RunnableBranch".to_string()))
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        call_with_config(self, input, config, |input, run| async move {
            let selected = self.select(&input, &run).await?;
            let (runnable, tag) = self.chosen(selected);
            runnable
                .invoke(input, Some(run.child_config(Some(&tag)).without_kwargs()))
                .await
        })
        .await
    }

    fn stream<'a>(&'a self, input: I, config: Option<RunnableConfig>) -> BoxStream<'a, Result<O>> {
        transform_stream_with_config(self, once_stream(input), config, move |mut inputs, run| {
            Box::pin(async_stream::stream! {
                let input = match inputs.next().await {
                    Some(Ok(input)) => input,
                    Some(Err(error)) => {
                        yield Err(error);
                        return;
                    }
                    None => return,
                };
                let selected = match self.select(&input, &run).await {
                    Ok(selected) => selected,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                let (runnable, tag) = self.chosen(selected);
                let config = run.child_config(Some(&tag)).without_kwargs();
                let mut output = runnable.stream(input, Some(config));
                while let Some(chunk) = output.next().await {
                    yield chunk;
                }
            })
        })
    }
}
