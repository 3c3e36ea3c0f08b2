use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bon::bon;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{Error, Result};

use super::base::{
    DynRunnable, Runnable, RunnableValue, call_with_config, once_stream,
    transform_stream_with_config,
};
use super::config::RunnableConfig;
use super::retry::ErrorClassifier;

/// Tries a primary runnable, then each fallback in order.
///
/// The first success wins. When every candidate fails, the last
/// candidate's error is returned. An error the classifier does not handle
/// ends the call immediately with that error.
pub struct RunnableWithFallbacks<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    pub runnable: DynRunnable<I, O>,
    pub fallbacks: Vec<DynRunnable<I, O>>,
    pub classifier: ErrorClassifier,
    name: Option<String>,
}

impl<I, O> Debug for RunnableWithFallbacks<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableWithFallbacks")
            .field("runnable", &self.runnable.get_name())
            .field("fallbacks_count", &self.fallbacks.len())
            .field("classifier", &self.classifier)
            .field("name", &self.name)
            .finish()
    }
}

#[bon]
impl<I, O> RunnableWithFallbacks<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    /// Wrap `runnable`, falling back on any error that is not fatal.
    pub fn new<R>(runnable: R, fallbacks: Vec<DynRunnable<I, O>>) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        Self::from_dyn()
            .runnable(Arc::new(runnable) as DynRunnable<I, O>)
            .fallbacks(fallbacks)
            .call()
    }

    #[builder]
    pub fn from_dyn(
        runnable: DynRunnable<I, O>,
        #[builder(default)] fallbacks: Vec<DynRunnable<I, O>>,
        #[builder(default = ErrorClassifier::AllButFatal)] classifier: ErrorClassifier,
        #[builder(into)] name: Option<String>,
    ) -> Self {
        Self {
            runnable,
            fallbacks,
            classifier,
            name,
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn runnables(&self) -> impl Iterator<Item = &DynRunnable<I, O>> {
        std::iter::once(&self.runnable).chain(self.fallbacks.iter())
    }
}

fn exhausted() -> Error {
    Error::other("No fallback candidates to run")
}

#[async_trait]
impl<I, O> Runnable for RunnableWithFallbacks<I, O>
where
    I: RunnableValue,
    O: RunnableValue,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn invoke(&self, input: I, config: Option<RunnableConfig>) -> Result<O> {
        call_with_config(self, input, config, |input, run| async move {
            let mut last_error = None;
            for candidate in self.runnables() {
                match candidate.invoke(input.clone(), Some(run.child_config(None))).await {
                    Ok(output) => return Ok(output),
                    Err(error) if self.classifier.handles(&error) => {
                        tracing::debug!(
                            target: "runnable_core::runnables",
                            candidate = %candidate.get_name(),
                            error = %error,
                            "Candidate failed, trying next fallback"
                        );
                        last_error = Some(error);
                    }
                    Err(error) => return Err(error),
                }
            }
            Err(last_error.unwrap_or_else(exhausted))
        })
        .await
    }

    /// A candidate is abandoned only if its stream fails before yielding
    /// anything. Once a chunk has been emitted, later errors are final.
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

                let mut last_error = None;
                for candidate in self.runnables() {
                    let mut output = candidate.stream(input.clone(), Some(run.child_config(None)));
                    match output.next().await {
                        Some(Ok(first)) => {
                            yield Ok(first);
                            while let Some(chunk) = output.next().await {
                                yield chunk;
                            }
                            return;
                        }
                        Some(Err(error)) if self.classifier.handles(&error) => {
                            last_error = Some(error);
                        }
                        Some(Err(error)) => {
                            yield Err(error);
                            return;
                        }
                        None => return,
                    }
                }
                yield Err(last_error.unwrap_or_else(exhausted));
            })
        })
    }
}
