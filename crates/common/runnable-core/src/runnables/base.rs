//! Base trait and lifecycle helpers for Runnables.
//!
//! Every unit of work implements [`Runnable`]. Implementations wrap their
//! body in [`call_with_config`] (for `invoke`) or
//! [`transform_stream_with_config`] (for `stream`/`transform`), which own
//! the run lifecycle: start event, recursion check, cancellation, and
//! exactly one end or error event.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::callbacks::{CallbackManagerForChainRun, ChainRunRef};
use crate::context::{self, ScopedStream, child_scope};
use crate::error::{Error, Result};
use crate::signal::{AbortSignal, race_with_signal};
use crate::tracers::event_stream::{self, EventFilter, StreamEvent};
use crate::tracers::root_listeners::Listeners;
use crate::tracers::schemas::RunType;

use super::binding::RunnableBinding;
use super::config::{
    RunnableConfig, ensure_config, get_callback_manager_for_config, get_config_list, patch_config,
};
use super::each::RunnableEach;
use super::fallbacks::RunnableWithFallbacks;
use super::retry::{RunnableRetry, RunnableRetryConfig};
use super::sequence::RunnableSequence;
use super::utils::{
    ChunkAggregator, gather_with_concurrency, short_type_name, try_gather_with_concurrency,
};

/// Concurrency used by batch and map when the config sets none.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Bound shared by every runnable input and output type.
///
/// Values must be serializable so runs can record snapshots and composers
/// can erase them to JSON.
pub trait RunnableValue:
    Serialize + DeserializeOwned + Clone + Send + Sync + Debug + 'static
{
}

impl<T> RunnableValue for T where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + Debug + 'static
{
}

/// A type-erased runnable.
pub type DynRunnable<I, O> = Arc<dyn Runnable<Input = I, Output = O>>;

/// A unit of work that can be invoked, batched, streamed, transformed and
/// composed.
///
/// Only [`invoke`](Self::invoke) is required. The defaults build batching on
/// top of `invoke` and streaming on top of a single `invoke`; units that can
/// produce output incrementally override [`stream`](Self::stream) and
/// [`transform`](Self::transform) and report
/// [`supports_transform`](Self::supports_transform).
///
/// All methods accept an optional config. Without one, the config of the
/// enclosing run (if any) is used.
#[async_trait]
pub trait Runnable: Send + Sync + Debug {
    type Input: RunnableValue;
    type Output: RunnableValue;

    /// Explicit name of this runnable, if it has one.
    fn name(&self) -> Option<String> {
        None
    }

    /// Name used for this runnable's runs.
    fn get_name(&self) -> String {
        self.name()
            .unwrap_or_else(|| short_type_name(std::any::type_name::<Self>()).to_string())
    }

    /// Run type tag recorded on this runnable's runs.
    fn run_type(&self) -> RunType {
        RunType::Chain
    }

    /// Whether [`transform`](Self::transform) consumes its input
    /// incrementally rather than buffering it.
    fn supports_transform(&self) -> bool {
        false
    }

    /// The steps of this runnable if it is a sequence, used to flatten
    /// nested sequences.
    fn sequence_steps(&self) -> Option<Vec<DynRunnable<Value, Value>>> {
        None
    }

    /// Transform a single input into an output.
    async fn invoke(&self, input: Self::Input, config: Option<RunnableConfig>)
    -> Result<Self::Output>;

    /// Invoke on every input with bounded concurrency.
    ///
    /// Outputs correspond positionally to inputs. The first failure is
    /// returned and items still in flight are dropped.
    async fn batch(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Self::Output>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let configs = get_config_list(config, inputs.len());
        let limit = max_concurrency(&configs);
        let futures: Vec<_> = inputs
            .into_iter()
            .zip(configs)
            .map(|(input, config)| self.invoke(input, Some(config)))
            .collect();
        try_gather_with_concurrency(limit, futures).await
    }

    /// Invoke on every input, keeping each item's outcome in place.
    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Self::Output>> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let configs = get_config_list(config, inputs.len());
        let limit = max_concurrency(&configs);
        let futures: Vec<_> = inputs
            .into_iter()
            .zip(configs)
            .map(|(input, config)| self.invoke(input, Some(config)))
            .collect();
        gather_with_concurrency(limit, futures).await
    }

    /// Stream the output for a single input.
    ///
    /// Nothing runs until the stream is polled. Dropping the stream drops
    /// all pending work.
    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        Box::pin(stream::once(self.invoke(input, config)))
    }

    /// Transform a stream of inputs into a stream of outputs.
    ///
    /// Default implementation concatenates the input chunks and then calls
    /// [`stream`](Self::stream).
    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Self::Input>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        Box::pin(async_stream::stream! {
            let mut input = input;
            let mut aggregator = ChunkAggregator::new();
            while let Some(chunk) = input.next().await {
                match chunk.and_then(|c| serde_json::to_value(c).map_err(Error::from)) {
                    Ok(value) => aggregator.push(value),
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if aggregator.is_empty() {
                return;
            }
            let input: Self::Input = match serde_json::from_value(aggregator.finish()) {
                Ok(input) => input,
                Err(e) => {
                    yield Err(Error::from(e));
                    return;
                }
            };
            let mut output = self.stream(input, config);
            while let Some(chunk) = output.next().await {
                yield chunk;
            }
        })
    }

    /// Stream the events of this runnable's run and of every run nested in
    /// it, instead of its output.
    ///
    /// Use [`event_stream::stream_events`] directly to filter the events.
    fn stream_events<'a>(
        &'a self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<StreamEvent>> {
        event_stream::stream_events(self, input, config, EventFilter::default())
    }

    /// Bind keyword arguments to this runnable.
    fn bind(self, kwargs: IndexMap<String, Value>) -> RunnableBinding<Self>
    where
        Self: Sized,
    {
        RunnableBinding::new(self).with_kwargs(kwargs)
    }

    /// Bind a config to this runnable.
    fn with_config(self, config: RunnableConfig) -> RunnableBinding<Self>
    where
        Self: Sized,
    {
        RunnableBinding::new(self).with_bound_config(config)
    }

    /// Call `listeners` when the root run of each invocation starts, ends
    /// or fails.
    fn with_listeners(self, listeners: Listeners) -> RunnableBinding<Self>
    where
        Self: Sized,
    {
        RunnableBinding::new(self).with_listeners(listeners)
    }

    /// Retry this runnable on failure.
    fn with_retry(self, config: RunnableRetryConfig) -> RunnableRetry<Self>
    where
        Self: Sized,
    {
        RunnableRetry::new(self, config)
    }

    /// Try `fallbacks` in order when this runnable fails.
    fn with_fallbacks(
        self,
        fallbacks: Vec<DynRunnable<Self::Input, Self::Output>>,
    ) -> RunnableWithFallbacks<Self::Input, Self::Output>
    where
        Self: Sized + 'static,
    {
        RunnableWithFallbacks::new(self, fallbacks)
    }

    /// Apply this runnable to every element of a list input.
    fn map(self) -> RunnableEach<Self>
    where
        Self: Sized,
    {
        RunnableEach::new(self)
    }

    /// Chain `next` after this runnable.
    fn pipe<R>(self, next: R) -> RunnableSequence
    where
        Self: Sized + 'static,
        R: Runnable + 'static,
    {
        RunnableSequence::pair(self.boxed(), next.boxed())
    }

    /// Erase to a JSON-in, JSON-out runnable.
    fn boxed(self) -> DynRunnable<Value, Value>
    where
        Self: Sized + 'static,
    {
        Arc::new(ValueRunnable::new(self))
    }

    /// Erase the concrete type, keeping the input and output types.
    fn into_dyn(self) -> DynRunnable<Self::Input, Self::Output>
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }
}

fn max_concurrency(configs: &[RunnableConfig]) -> usize {
    configs
        .first()
        .and_then(|c| c.max_concurrency)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY)
}

/// Outcomes of a partial-failure batch.
pub trait BatchResults<T> {
    /// Succeed with every output, or fail with [`Error::AggregateBatch`]
    /// listing each failed item by input index.
    fn into_aggregate(self) -> Result<Vec<T>>;
}

impl<T> BatchResults<T> for Vec<Result<T>> {
    fn into_aggregate(self) -> Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(self.len());
        let mut errors = Vec::new();
        for (index, result) in self.into_iter().enumerate() {
            match result {
                Ok(output) => outputs.push(output),
                Err(error) => errors.push((index, error)),
            }
        }
        if errors.is_empty() {
            Ok(outputs)
        } else {
            Err(Error::AggregateBatch { errors })
        }
    }
}

#[async_trait]
impl<R> Runnable for Arc<R>
where
    R: Runnable + ?Sized,
{
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> Option<String> {
        (**self).name()
    }

    fn get_name(&self) -> String {
        (**self).get_name()
    }

    fn run_type(&self) -> RunType {
        (**self).run_type()
    }

    fn supports_transform(&self) -> bool {
        (**self).supports_transform()
    }

    fn sequence_steps(&self) -> Option<Vec<DynRunnable<Value, Value>>> {
        (**self).sequence_steps()
    }

    async fn invoke(
        &self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> Result<Self::Output> {
        (**self).invoke(input, config).await
    }

    async fn batch(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Self::Output>> {
        (**self).batch(inputs, config).await
    }

    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Self::Input>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Self::Output>> {
        (**self).batch_with_exceptions(inputs, config).await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        (**self).stream(input, config)
    }

    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Self::Input>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Self::Output>> {
        (**self).transform(input, config)
    }
}

/// Adapter presenting a typed runnable as JSON in, JSON out.
///
/// Transparent: it creates no run of its own and forwards names, run type
/// and streaming capability.
#[derive(Debug)]
pub struct ValueRunnable<R> {
    inner: R,
}

impl<R: Runnable> ValueRunnable<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

fn from_json<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[async_trait]
impl<R> Runnable for ValueRunnable<R>
where
    R: Runnable,
{
    type Input = Value;
    type Output = Value;

    fn name(&self) -> Option<String> {
        self.inner.name()
    }

    fn get_name(&self) -> String {
        self.inner.get_name()
    }

    fn run_type(&self) -> RunType {
        self.inner.run_type()
    }

    fn supports_transform(&self) -> bool {
        self.inner.supports_transform()
    }

    fn sequence_steps(&self) -> Option<Vec<DynRunnable<Value, Value>>> {
        self.inner.sequence_steps()
    }

    async fn invoke(&self, input: Value, config: Option<RunnableConfig>) -> Result<Value> {
        let output = self.inner.invoke(from_json(input)?, config).await?;
        to_json(&output)
    }

    async fn batch(
        &self,
        inputs: Vec<Value>,
        config: Option<RunnableConfig>,
    ) -> Result<Vec<Value>> {
        let inputs = inputs
            .into_iter()
            .map(from_json)
            .collect::<Result<Vec<R::Input>>>()?;
        let outputs = self.inner.batch(inputs, config).await?;
        outputs.iter().map(to_json).collect()
    }

    async fn batch_with_exceptions(
        &self,
        inputs: Vec<Value>,
        config: Option<RunnableConfig>,
    ) -> Vec<Result<Value>> {
        let mut results: Vec<Option<Result<Value>>> = Vec::with_capacity(inputs.len());
        let mut valid = Vec::new();
        let mut positions = Vec::new();
        for (index, input) in inputs.into_iter().enumerate() {
            match from_json::<R::Input>(input) {
                Ok(input) => {
                    valid.push(input);
                    positions.push(index);
                    results.push(None);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }
        let outputs = self.inner.batch_with_exceptions(valid, config).await;
        for (index, output) in positions.into_iter().zip(outputs) {
            results[index] = Some(output.and_then(|o| to_json(&o)));
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::other("No result for batch item"))))
            .collect()
    }

    fn stream<'a>(
        &'a self,
        input: Value,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        match from_json(input) {
            Ok(input) => self
                .inner
                .stream(input, config)
                .map(|chunk| chunk.and_then(|c| to_json(&c)))
                .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<Value>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<Value>> {
        let input = input.map(|chunk| chunk.and_then(from_json)).boxed();
        self.inner
            .transform(input, config)
            .map(|chunk| chunk.and_then(|c| to_json(&c)))
            .boxed()
    }
}

/// A stream yielding `input` once.
pub fn once_stream<'a, T: Send + 'a>(input: T) -> BoxStream<'a, Result<T>> {
    stream::once(async move { Ok(input) }).boxed()
}

/// Access to the active run, handed to a unit's body by the lifecycle
/// helpers.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run: ChainRunRef,
    config: RunnableConfig,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run.run_id()
    }

    /// The resolved config this run was started with.
    pub fn config(&self) -> &RunnableConfig {
        &self.config
    }

    pub fn signal(&self) -> Option<&AbortSignal> {
        self.config.signal.as_ref()
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.config.kwarg(key)
    }

    /// Config for a call nested under this run.
    ///
    /// `tag` applies to the child run only. Bound kwargs are kept, so
    /// wrappers pass them through to the unit they wrap; composers drop them
    /// with [`RunnableConfig::without_kwargs`].
    pub fn child_config(&self, tag: Option<&str>) -> RunnableConfig {
        patch_config()
            .config(self.config.clone())
            .callbacks(self.run.get_child(tag))
            .recursion_depth(self.config.recursion_depth + 1)
            .call()
    }

    /// Report a streamed chunk to this run's handlers.
    pub async fn on_chunk(&self, chunk: &Value) {
        self.run.on_stream_chunk(chunk).await;
    }

    /// Report a failed attempt that is about to be retried.
    pub async fn on_retry(&self, error: &Error, attempt: usize) {
        self.run.on_retry(error, attempt).await;
    }

    pub async fn on_custom_event(&self, name: &str, data: Value) {
        self.run.on_custom_event(name, data).await;
    }
}

async fn start_run<R>(
    runnable: &R,
    inputs: Value,
    config: &RunnableConfig,
) -> CallbackManagerForChainRun
where
    R: Runnable + ?Sized,
{
    let manager = get_callback_manager_for_config(config);
    manager
        .on_chain_start()
        .inputs(inputs)
        .name(
            config
                .run_name
                .clone()
                .unwrap_or_else(|| runnable.get_name()),
        )
        .run_type(runnable.run_type())
        .maybe_run_id(config.run_id)
        .call()
        .await
}

fn check_recursion(config: &RunnableConfig) -> Result<()> {
    let limit = config.recursion_limit();
    if config.recursion_depth > limit {
        return Err(Error::RecursionLimit { limit });
    }
    Ok(())
}

/// A started run whose body is driven by the caller.
///
/// Composers that advance several runs in lockstep (sequence batching) hold
/// one of these per item; the lifecycle helpers below use it for a single
/// run.
pub(crate) struct ActiveRun {
    manager: CallbackManagerForChainRun,
    handle: RunHandle,
    scope: context::SharedScope,
}

impl ActiveRun {
    /// Create the run, dispatch its start event and check the recursion
    /// limit. `config` must already be resolved with [`ensure_config`].
    pub(crate) async fn start<R>(
        runnable: &R,
        inputs: Value,
        config: RunnableConfig,
    ) -> Result<Self>
    where
        R: Runnable + ?Sized,
    {
        let manager = start_run(runnable, inputs, &config).await;
        if let Err(error) = check_recursion(&config) {
            manager.on_chain_error(&error).await;
            return Err(error);
        }
        let handle = RunHandle {
            run: manager.shared(),
            config,
        };
        let scope = child_scope(Some(handle.child_config(None).without_kwargs()));
        Ok(Self {
            manager,
            handle,
            scope,
        })
    }

    pub(crate) fn handle(&self) -> &RunHandle {
        &self.handle
    }

    /// Run `fut` inside this run's context scope, raced against its signal.
    pub(crate) fn scoped<T, F>(&self, fut: F) -> impl Future<Output = Result<T>> + use<T, F>
    where
        F: Future<Output = Result<T>>,
    {
        let scope = self.scope.clone();
        let signal = self.handle.config.signal.clone();
        async move { context::enter(scope, race_with_signal(fut, signal.as_ref())).await }
    }

    /// Wrap `stream` so every poll happens inside this run's scope.
    fn scoped_stream<'a, T: 'a>(&self, stream: BoxStream<'a, T>) -> ScopedStream<'a, T> {
        ScopedStream::new(self.scope.clone(), stream)
    }

    fn set_inputs(&self, inputs: Value) {
        self.manager.set_inputs(inputs);
    }

    /// Dispatch the end or error event matching `result`.
    pub(crate) async fn finish<T: Serialize>(self, result: &Result<T>) {
        match result {
            Ok(output) => {
                self.manager
                    .on_chain_end(serde_json::to_value(output).unwrap_or_default())
                    .await
            }
            Err(error) => self.manager.on_chain_error(error).await,
        }
    }

    pub(crate) async fn fail(self, error: &Error) {
        self.manager.on_chain_error(error).await;
    }
}

/// Run `func` as a traced call of `runnable`.
///
/// Creates the run and dispatches its start event, enforces the recursion
/// limit, races `func` against the abort signal inside a child context
/// scope, and dispatches exactly one end or error event. The error `func`
/// returns is passed through unchanged.
pub async fn call_with_config<R, F, Fut>(
    runnable: &R,
    input: R::Input,
    config: Option<RunnableConfig>,
    func: F,
) -> Result<R::Output>
where
    R: Runnable + ?Sized,
    F: FnOnce(R::Input, RunHandle) -> Fut + Send,
    Fut: Future<Output = Result<R::Output>> + Send,
{
    let config = ensure_config(config);
    let inputs = serde_json::to_value(&input).unwrap_or_default();
    let run = ActiveRun::start(runnable, inputs, config).await?;
    let result = run.scoped(func(input, run.handle().clone())).await;
    run.finish(&result).await;
    result
}

/// Run `transformer` as a traced streaming call of `runnable`.
///
/// The run starts when the returned stream is first polled. Input and
/// output chunks are aggregated into the run's snapshots. Every poll races
/// the abort signal. On failure the chunks already produced have been
/// yielded and the error is yielded last.
pub fn transform_stream_with_config<'a, R, F>(
    runnable: &'a R,
    input: BoxStream<'a, Result<R::Input>>,
    config: Option<RunnableConfig>,
    transformer: F,
) -> BoxStream<'a, Result<R::Output>>
where
    R: Runnable + ?Sized,
    F: FnOnce(BoxStream<'a, Result<R::Input>>, RunHandle) -> BoxStream<'a, Result<R::Output>>
        + Send
        + 'a,
{
    let config = ensure_config(config);
    Box::pin(async_stream::stream! {
        let signal = config.signal.clone();
        let run = match ActiveRun::start(runnable, Value::Null, config).await {
            Ok(run) => run,
            Err(error) => {
                yield Err(error);
                return;
            }
        };

        let input_aggregate = Arc::new(Mutex::new(ChunkAggregator::new()));
        let tap = input_aggregate.clone();
        let input = input
            .inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    tap.lock().push(serde_json::to_value(chunk).unwrap_or_default());
                }
            })
            .boxed();
        let mut output = run.scoped_stream(transformer(input, run.handle().clone()));
        let mut output_aggregate = ChunkAggregator::new();

        loop {
            let next = race_with_signal(async { Ok(output.next().await) }, signal.as_ref()).await;
            match next {
                Ok(Some(Ok(chunk))) => {
                    let value = serde_json::to_value(&chunk).unwrap_or_default();
                    run.manager.on_output_chunk(&value).await;
                    output_aggregate.push(value);
                    yield Ok(chunk);
                }
                Ok(Some(Err(error))) | Err(error) => {
                    drop(output);
                    run.set_inputs(std::mem::take(&mut *input_aggregate.lock()).finish());
                    run.fail(&error).await;
                    yield Err(error);
                    return;
                }
                Ok(None) => break,
            }
        }

        drop(output);
        run.set_inputs(std::mem::take(&mut *input_aggregate.lock()).finish());
        run.manager.on_chain_end(output_aggregate.finish()).await;
    })
}
