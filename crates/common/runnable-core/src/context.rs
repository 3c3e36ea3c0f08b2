//! Task-scoped run context.
//!
//! Every run executes inside a [`RunScope`] stored in a tokio task-local.
//! A scope holds the context variable bag and the ambient
//! [`RunnableConfig`] for code running inside the unit, so nested calls that
//! pass no config still attach to the enclosing run.
//!
//! Scopes are copy-on-enter: a child run starts from a copy of its parent's
//! bag, so writes made by the child are seen by its own descendants and
//! never by the parent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::runnables::RunnableConfig;

/// The context variable bag: string keys to JSON values.
pub type ContextBag = IndexMap<String, Value>;

/// State attached to one level of run nesting.
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    /// Context variables visible at this level.
    pub vars: ContextBag,
    /// Config that nested calls inherit when they are given none.
    pub config: Option<RunnableConfig>,
}

pub(crate) type SharedScope = Arc<Mutex<RunScope>>;

tokio::task_local! {
    static RUN_SCOPE: SharedScope;
}

fn with_current<T>(f: impl FnOnce(&mut RunScope) -> T) -> Option<T> {
    RUN_SCOPE.try_with(|scope| f(&mut scope.lock())).ok()
}

/// Read a context variable set by this run or one of its ancestors.
///
/// Returns `None` when the key was never set or when called outside any run.
pub fn get_context_variable(key: &str) -> Option<Value> {
    with_current(|scope| scope.vars.get(key).cloned()).flatten()
}

/// Set a context variable for the current run and its descendants.
///
/// Fails with [`Error::Scope`] when called outside any run.
pub fn set_context_variable(key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
    let key = key.into();
    let value = value.into();
    with_current(move |scope| {
        scope.vars.insert(key, value);
    })
    .ok_or_else(|| {
        Error::Scope("set_context_variable called outside of a runnable execution".into())
    })
}

/// Snapshot of every context variable visible to the current run.
pub fn get_context_variables() -> ContextBag {
    with_current(|scope| scope.vars.clone()).unwrap_or_default()
}

/// The config of the innermost active run, with its run id cleared.
pub fn get_current_config() -> Option<RunnableConfig> {
    with_current(|scope| scope.config.clone()).flatten().map(|mut config| {
        config.run_id = None;
        config
    })
}

/// Create a scope that starts from a copy of the current one.
pub(crate) fn child_scope(config: Option<RunnableConfig>) -> SharedScope {
    let vars = with_current(|scope| scope.vars.clone()).unwrap_or_default();
    Arc::new(Mutex::new(RunScope { vars, config }))
}

/// Run `fut` inside `scope`.
pub(crate) async fn enter<F: Future>(scope: SharedScope, fut: F) -> F::Output {
    RUN_SCOPE.scope(scope, fut).await
}

/// Run `fut` in a fresh child scope.
///
/// The future may set context variables even when no run is active; they
/// are discarded when it completes.
pub async fn run_in_context<F: Future>(fut: F) -> F::Output {
    let config = with_current(|scope| scope.config.clone()).flatten();
    enter(child_scope(config), fut).await
}

/// A stream that re-enters its run scope on every poll.
///
/// Streams are polled by whoever consumes them, possibly far from the task
/// that created them; carrying the scope keeps context lookups inside the
/// stream bound to the run that produced it.
pub struct ScopedStream<'a, T> {
    scope: SharedScope,
    inner: BoxStream<'a, T>,
}

impl<'a, T> ScopedStream<'a, T> {
    pub(crate) fn new(scope: SharedScope, inner: BoxStream<'a, T>) -> Self {
        Self { scope, inner }
    }

    /// Wrap `inner` in a fresh child of the current scope.
    pub fn in_child_scope(inner: BoxStream<'a, T>) -> Self {
        let config = with_current(|scope| scope.config.clone()).flatten();
        Self::new(child_scope(config), inner)
    }
}

impl<T> Stream for ScopedStream<'_, T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let inner = &mut this.inner;
        RUN_SCOPE.sync_scope(this.scope.clone(), || inner.as_mut().poll_next(cx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
