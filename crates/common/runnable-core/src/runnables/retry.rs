use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bon::bon;

use crate::error::{AbortReason, Error, Result};
use crate::signal::sleep_with_signal;
use crate::tracers::schemas::RunType;

use super::base::{ActiveRun, DEFAULT_MAX_CONCURRENCY, Runnable, call_with_config};
use super::config::{RunnableConfig, get_config_list};
use super::utils::gather_with_concurrency;

/// Decides which errors a retry or fallback wrapper handles.
///
/// Fatal errors (recursion limit, abort) are never handled, whatever the
/// classifier says.
#[derive(Debug, Clone, Default)]
pub enum ErrorClassifier {
    /// Transient failures only: see [`Error::is_retryable`].
    #[default]
    Transient,
    /// Every error that is not fatal.
    AllButFatal,
    Custom(fn(&Error) -> bool),
}

impl ErrorClassifier {
    pub fn handles(&self, error: &Error) -> bool {
        if error.is_fatal() {
            return false;
        }
        match self {
            ErrorClassifier::Transient => error.is_retryable(),
            ErrorClassifier::AllButFatal => true,
            ErrorClassifier::Custom(predicate) => predicate(error),
        }
    }
}

/// Called with the error and attempt number after each failed attempt that
/// will be retried.
pub type FailedAttemptHook = Arc<dyn Fn(&Error, usize) + Send + Sync>;

#[derive(Clone)]
pub struct RunnableRetryConfig {
    pub classifier: ErrorClassifier,

    pub max_attempt_number: usize,

    /// Wait between attempts with exponential backoff plus jitter. When
    /// off, attempts follow each other immediately.
    pub wait_exponential_jitter: bool,

    pub initial_delay: Duration,

    pub max_delay: Duration,

    pub on_failed_attempt: Option<FailedAttemptHook>,
}

impl Debug for RunnableRetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRetryConfig")
            .field("classifier", &self.classifier)
            .field("max_attempt_number", &self.max_attempt_number)
            .field("wait_exponential_jitter", &self.wait_exponential_jitter)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("on_failed_attempt", &self.on_failed_attempt.is_some())
            .finish()
    }
}

impl Default for RunnableRetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl RunnableRetryConfig {
    #[builder]
    pub fn new(
        #[builder(default)] classifier: ErrorClassifier,
        #[builder(default = 3)] max_attempt_number: usize,
        #[builder(default = true)] wait_exponential_jitter: bool,
        #[builder(default = Duration::from_secs(1))] initial_delay: Duration,
        #[builder(default = Duration::from_secs(60))] max_delay: Duration,
        on_failed_attempt: Option<FailedAttemptHook>,
    ) -> Self {
        Self {
            classifier,
            max_attempt_number: max_attempt_number.max(1),
            wait_exponential_jitter,
            initial_delay,
            max_delay,
            on_failed_attempt,
        }
    }

    /// Delays before attempts 2, 3, ... in order.
    fn delays(&self) -> Vec<Duration> {
        let retries = self.max_attempt_number.saturating_sub(1);
        if !self.wait_exponential_jitter {
            return vec![Duration::ZERO; retries];
        }
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(retries)
            .with_jitter()
            .build()
            .collect()
    }

    fn failed_attempt(&self, error: &Error, attempt: usize) {
        tracing::debug!(
            target: "runnable_core::runnables",
            attempt,
            error = %error,
            "Attempt failed, retrying"
        );
        if let Some(hook) = &self.on_failed_attempt {
            hook(error, attempt);
        }
    }
}

fn attempt_tag(attempt: usize) -> Option<String> {
    (attempt > 1).then(|| format!("retry:attempt:{attempt}"))
}

/// Retries the wrapped runnable on failures its classifier handles.
///
/// The last error is returned unchanged once attempts run out. Raising the
/// abort signal during a backoff wait ends the call at once.
pub struct RunnableRetry<R>
where
    R: Runnable,
{
    bound: R,

    config: RunnableRetryConfig,
}

impl<R> Debug for RunnableRetry<R>
where
    R: Runnable,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRetry")
            .field("bound", &self.bound)
            .field("max_attempt_number", &self.config.max_attempt_number)
            .field(
                "wait_exponential_jitter",
                &self.config.wait_exponential_jitter,
            )
            .finish()
    }
}

impl<R> RunnableRetry<R>
where
    R: Runnable,
{
    pub fn new(bound: R, config: RunnableRetryConfig) -> Self {
        Self { bound, config }
    }

    pub fn bound(&self) -> &R {
        &self.bound
    }

    pub fn retry_config(&self) -> &RunnableRetryConfig {
        &self.config
    }

    fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        attempt < self.config.max_attempt_number && self.config.classifier.handles(error)
    }
}

#[async_trait]
impl<R> Runnable for RunnableRetry<R>
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

    async fn invoke(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<Self::Output> {
        call_with_config(self, input, config, |input, run| async move {
            let mut delays = self.config.delays().into_iter();
            let mut attempt = 1;
            loop {
                let config = run.child_config(attempt_tag(attempt).as_deref());
                match self.bound.invoke(input.clone(), Some(config)).await {
                    Ok(output) => return Ok(output),
                    Err(error) if self.should_retry(&error, attempt) => {
                        self.config.failed_attempt(&error, attempt);
                        run.on_retry(&error, attempt).await;
                        sleep_with_signal(delays.next().unwrap_or_default(), run.signal()).await?;
                        attempt += 1;
                    }
                    Err(error) => return Err(error),
                }
            }
        })
        .await
    }

    /// Each item gets its own run. Only the items whose last attempt failed
    /// with a handled error are attempted again.
    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Self::Output>> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let configs = get_config_list(config, inputs.len());
        let limit = configs
            .first()
            .and_then(|c| c.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);

        let mut results: Vec<Option<Result<Self::Output>>> = inputs.iter().map(|_| None).collect();
        let mut runs = Vec::with_capacity(inputs.len());
        for (index, (input, config)) in inputs.iter().zip(configs).enumerate() {
            let snapshot = serde_json::to_value(input).unwrap_or_default();
            match ActiveRun::start(self, snapshot, config).await {
                Ok(run) => runs.push(Some(run)),
                Err(error) => {
                    runs.push(None);
                    results[index] = Some(Err(error));
                }
            }
        }

        let mut remaining: Vec<usize> = (0..inputs.len()).filter(|&i| runs[i].is_some()).collect();
        let mut delays = self.config.delays().into_iter();
        let mut attempt = 1;
        while !remaining.is_empty() {
            let tag = attempt_tag(attempt);
            let futures: Vec<_> = remaining
                .iter()
                .filter_map(|&index| {
                    let run = runs[index].as_ref()?;
                    let config = run.handle().child_config(tag.as_deref());
                    Some(run.scoped(self.bound.invoke(inputs[index].clone(), Some(config))))
                })
                .collect();
            let outcomes = gather_with_concurrency(limit, futures).await;

            let mut retry = Vec::new();
            for (index, outcome) in remaining.into_iter().zip(outcomes) {
                match outcome {
                    Err(error) if self.should_retry(&error, attempt) => {
                        self.config.failed_attempt(&error, attempt);
                        if let Some(run) = &runs[index] {
                            run.handle().on_retry(&error, attempt).await;
                        }
                        retry.push(index);
                    }
                    outcome => results[index] = Some(outcome),
                }
            }
            remaining = retry;
            if remaining.is_empty() {
                break;
            }

            let signal = remaining
                .first()
                .and_then(|&i| runs[i].as_ref())
                .and_then(|run| run.handle().signal().cloned());
            if let Err(error) =
                sleep_with_signal(delays.next().unwrap_or_default(), signal.as_ref()).await
            {
                let reason = signal
                    .as_ref()
                    .and_then(|s| s.reason())
                    .unwrap_or(AbortReason::Cancelled);
                for &index in &remaining {
                    results[index] = Some(Err(Error::Aborted(reason.clone())));
                }
                tracing::debug!(
                    target: "runnable_core::runnables",
                    error = %error,
                    "Retry batch aborted during backoff"
                );
                break;
            }
            attempt += 1;
        }

        let mut outputs = Vec::with_capacity(results.len());
        for (run, result) in runs.into_iter().zip(results) {
            let result =
                result.unwrap_or_else(|| Err(Error::other("No result for batch item")));
            if let Some(run) = run {
                run.finish(&result).await;
            }
            outputs.push(result);
        }
        outputs
    }
}
