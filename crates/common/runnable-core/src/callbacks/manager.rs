//! Callback managers and run managers.
//!
//! A [`CallbackManager`] holds the handlers, tags and metadata that apply to
//! the next run. Starting a run turns it into a
//! [`CallbackManagerForChainRun`], which owns the [`Run`] record until the run
//! ends. Ending a run consumes its manager, so a run can only end once.

use std::any::Any;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bon::bon;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

use super::base::{ArcCallbackHandler, CallbackEvent, CallbackHandler};
use super::queue::CallbackQueue;
use crate::context::get_current_config;
use crate::error::{AbortReason, Error, Result};
use crate::globals::{callbacks_in_background, get_debug};
use crate::tracers::schemas::{Run, RunEvent, RunType};
use crate::tracers::stdout::ConsoleCallbackHandler;

/// Deliver `event` to every handler in `handlers`.
///
/// Handlers that await are called in order before this returns; the rest are
/// pushed onto the process-wide [`CallbackQueue`]. Failures and panics are
/// logged and swallowed.
pub async fn dispatch(handlers: &[ArcCallbackHandler], event: CallbackEvent) {
    if handlers.is_empty() {
        return;
    }
    let background = callbacks_in_background();
    let event = Arc::new(event);
    for handler in handlers {
        if background && !handler.awaits() {
            enqueue_delivery(vec![handler.clone()], event.clone());
        } else {
            deliver_isolated(handler.as_ref(), &event).await;
        }
    }
}

fn enqueue_delivery(handlers: Vec<ArcCallbackHandler>, event: Arc<CallbackEvent>) {
    let label = match handlers.as_slice() {
        [handler] => format!("{}.{}", handler.name(), event.hook_name()),
        _ => event.hook_name().to_string(),
    };
    CallbackQueue::global().enqueue(label, async move {
        for handler in &handlers {
            deliver_isolated(handler.as_ref(), &event).await;
        }
    });
}

/// Delivery of a run's end or error event.
///
/// If the dispatching future is dropped part way through, the handlers that
/// have not finished seeing the event get it through the background queue.
struct TerminalDelivery {
    handlers: Vec<ArcCallbackHandler>,
    next: usize,
    event: Arc<CallbackEvent>,
}

impl TerminalDelivery {
    fn new(handlers: Vec<ArcCallbackHandler>, event: CallbackEvent) -> Self {
        Self {
            handlers,
            next: 0,
            event: Arc::new(event),
        }
    }

    async fn run(mut self) {
        let background = callbacks_in_background();
        while let Some(handler) = self.handlers.get(self.next).cloned() {
            if background && !handler.awaits() {
                enqueue_delivery(vec![handler], self.event.clone());
            } else {
                deliver_isolated(handler.as_ref(), &self.event).await;
            }
            self.next += 1;
        }
    }
}

impl Drop for TerminalDelivery {
    fn drop(&mut self) {
        if self.next >= self.handlers.len() {
            return;
        }
        let remaining = self.handlers.split_off(self.next);
        enqueue_delivery(remaining, self.event.clone());
    }
}

async fn deliver_isolated(handler: &dyn CallbackHandler, event: &CallbackEvent) {
    match AssertUnwindSafe(event.deliver(handler)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(
                target: "runnable_core::callbacks",
                "Error in {}.{} callback: {}",
                handler.name(),
                event.hook_name(),
                error,
            );
        }
        Err(payload) => {
            tracing::warn!(
                target: "runnable_core::callbacks",
                "Panic in {}.{} callback: {}",
                handler.name(),
                event.hook_name(),
                panic_message(payload.as_ref()),
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown error".to_string()
    }
}

/// Callbacks attached to a config: a plain handler list or a full manager.
#[derive(Debug, Clone)]
pub enum Callbacks {
    Handlers(Vec<ArcCallbackHandler>),
    Manager(CallbackManager),
}

impl Callbacks {
    pub fn from_handlers(handlers: Vec<ArcCallbackHandler>) -> Self {
        Callbacks::Handlers(handlers)
    }

    /// Convert to a manager. Plain handlers become inheritable.
    pub fn to_manager(&self) -> CallbackManager {
        match self {
            Callbacks::Handlers(handlers) => {
                let mut manager = CallbackManager::new();
                for handler in handlers {
                    manager.add_handler(handler.clone(), true);
                }
                manager
            }
            Callbacks::Manager(manager) => manager.clone(),
        }
    }

    /// Combine two callback sets; handlers from `other` are appended.
    pub fn merge(&self, other: &Callbacks) -> Callbacks {
        match (self, other) {
            (Callbacks::Handlers(base), Callbacks::Handlers(extra)) => {
                let mut merged = base.clone();
                for handler in extra {
                    if !merged.iter().any(|h| Arc::ptr_eq(h, handler)) {
                        merged.push(handler.clone());
                    }
                }
                Callbacks::Handlers(merged)
            }
            (Callbacks::Manager(manager), Callbacks::Handlers(extra))
            | (Callbacks::Handlers(extra), Callbacks::Manager(manager)) => {
                let mut merged = manager.clone();
                for handler in extra {
                    merged.add_handler(handler.clone(), true);
                }
                Callbacks::Manager(merged)
            }
            (Callbacks::Manager(base), Callbacks::Manager(extra)) => {
                let mut merged = extra.clone();
                for handler in &base.inheritable_handlers {
                    merged.add_handler(handler.clone(), true);
                }
                merged.add_tags(base.inheritable_tags.clone(), true);
                merged.add_metadata(base.inheritable_metadata.clone(), true);
                Callbacks::Manager(merged)
            }
        }
    }
}

impl From<Vec<ArcCallbackHandler>> for Callbacks {
    fn from(handlers: Vec<ArcCallbackHandler>) -> Self {
        Callbacks::Handlers(handlers)
    }
}

impl From<CallbackManager> for Callbacks {
    fn from(manager: CallbackManager) -> Self {
        Callbacks::Manager(manager)
    }
}

/// Position of a parent run inside its trace.
#[derive(Debug, Clone)]
pub struct ParentTrace {
    pub trace_id: Uuid,
    pub dotted_order: String,
}

/// Handlers, tags and metadata for the next run to start.
#[derive(Debug, Clone, Default)]
pub struct CallbackManager {
    pub handlers: Vec<ArcCallbackHandler>,
    pub inheritable_handlers: Vec<ArcCallbackHandler>,
    pub parent_run_id: Option<Uuid>,
    pub parent_trace: Option<ParentTrace>,
    pub tags: Vec<String>,
    pub inheritable_tags: Vec<String>,
    pub metadata: IndexMap<String, Value>,
    pub inheritable_metadata: IndexMap<String, Value>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler unless the same handler is already registered.
    pub fn add_handler(&mut self, handler: ArcCallbackHandler, inherit: bool) {
        if !self.handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.handlers.push(handler.clone());
        }
        if inherit
            && !self
                .inheritable_handlers
                .iter()
                .any(|h| Arc::ptr_eq(h, &handler))
        {
            self.inheritable_handlers.push(handler);
        }
    }

    pub fn add_tags(&mut self, tags: Vec<String>, inherit: bool) {
        for tag in tags {
            if inherit && !self.inheritable_tags.contains(&tag) {
                self.inheritable_tags.push(tag.clone());
            }
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }

    pub fn add_metadata(&mut self, metadata: IndexMap<String, Value>, inherit: bool) {
        if inherit {
            self.inheritable_metadata.extend(metadata.clone());
        }
        self.metadata.extend(metadata);
    }

    /// Build the manager for a run from the callbacks, tags and metadata in
    /// its config.
    ///
    /// When debug mode is on a [`ConsoleCallbackHandler`] is added.
    pub fn configure(
        callbacks: Option<&Callbacks>,
        tags: &[String],
        metadata: &IndexMap<String, Value>,
    ) -> Self {
        let mut manager = callbacks.map(Callbacks::to_manager).unwrap_or_default();
        manager.add_tags(tags.to_vec(), true);
        manager.add_metadata(metadata.clone(), true);

        if get_debug()
            && !manager
                .handlers
                .iter()
                .any(|h| h.name() == ConsoleCallbackHandler::NAME)
        {
            manager.add_handler(Arc::new(ConsoleCallbackHandler::new()), true);
        }
        manager
    }
}

#[bon]
impl CallbackManager {
    /// Start a run and dispatch its start event.
    #[builder]
    pub async fn on_chain_start(
        &self,
        inputs: Value,
        #[builder(into)] name: String,
        run_type: Option<RunType>,
        run_id: Option<Uuid>,
    ) -> CallbackManagerForChainRun {
        let run_id = run_id.unwrap_or_else(Uuid::now_v7);
        let mut run = Run::new(run_id, name, run_type.unwrap_or_default(), inputs);
        if let Some(parent_run_id) = self.parent_run_id {
            match &self.parent_trace {
                Some(parent) => {
                    run = run.with_parent(parent_run_id, parent.trace_id, &parent.dotted_order);
                }
                None => run.parent_run_id = Some(parent_run_id),
            }
        }
        run.add_tags(&self.tags);
        run.metadata = self.metadata.clone();

        dispatch(&self.handlers, CallbackEvent::RunStart(run.clone())).await;

        CallbackManagerForChainRun {
            shared: ChainRunRef {
                inner: Arc::new(ChainRunInner {
                    run_id,
                    parent_run_id: run.parent_run_id,
                    trace: ParentTrace {
                        trace_id: run.trace_id,
                        dotted_order: run.dotted_order.clone(),
                    },
                    tags: run.tags.clone(),
                    run: Mutex::new(run),
                    handlers: self.handlers.clone(),
                    inheritable_handlers: self.inheritable_handlers.clone(),
                    inheritable_tags: self.inheritable_tags.clone(),
                    inheritable_metadata: self.inheritable_metadata.clone(),
                }),
            },
            finished: false,
        }
    }
}

#[derive(Debug)]
struct ChainRunInner {
    run_id: Uuid,
    parent_run_id: Option<Uuid>,
    trace: ParentTrace,
    tags: Vec<String>,
    run: Mutex<Run>,
    handlers: Vec<ArcCallbackHandler>,
    inheritable_handlers: Vec<ArcCallbackHandler>,
    inheritable_tags: Vec<String>,
    inheritable_metadata: IndexMap<String, Value>,
}

/// Shared view of an in-progress run.
///
/// Can report intermediate events and hand out child managers, but cannot
/// end the run.
#[derive(Debug, Clone)]
pub struct ChainRunRef {
    inner: Arc<ChainRunInner>,
}

impl ChainRunRef {
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.inner.parent_run_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.inner.trace.trace_id
    }

    pub fn handlers(&self) -> &[ArcCallbackHandler] {
        &self.inner.handlers
    }

    pub fn tags(&self) -> &[String] {
        &self.inner.tags
    }

    /// Snapshot of the run record as it stands.
    pub fn snapshot(&self) -> Run {
        self.inner.run.lock().clone()
    }

    /// Replace the input snapshot. Streaming runs only know their full
    /// input once the input stream is exhausted.
    pub fn set_inputs(&self, inputs: Value) {
        self.inner.run.lock().inputs = inputs;
    }

    /// Manager for a run nested under this one.
    ///
    /// `tag` applies to the child run only and is not inherited further.
    pub fn get_child(&self, tag: Option<&str>) -> CallbackManager {
        let mut manager = CallbackManager {
            handlers: self.inner.inheritable_handlers.clone(),
            inheritable_handlers: self.inner.inheritable_handlers.clone(),
            parent_run_id: Some(self.inner.run_id),
            parent_trace: Some(self.inner.trace.clone()),
            tags: self.inner.inheritable_tags.clone(),
            inheritable_tags: self.inner.inheritable_tags.clone(),
            metadata: self.inner.inheritable_metadata.clone(),
            inheritable_metadata: self.inner.inheritable_metadata.clone(),
        };
        if let Some(tag) = tag {
            manager.add_tags(vec![tag.to_string()], false);
        }
        manager
    }

    /// Report a streamed chunk.
    pub async fn on_stream_chunk(&self, chunk: &Value) {
        self.inner
            .run
            .lock()
            .add_event(RunEvent::with_kwargs("new_token", json!({ "chunk": chunk })));
        dispatch(
            &self.inner.handlers,
            CallbackEvent::StreamChunk {
                chunk: chunk.clone(),
                run_id: self.inner.run_id,
                parent_run_id: self.inner.parent_run_id,
            },
        )
        .await;
    }

    /// Report a chunk of this run's output as it is yielded.
    pub async fn on_output_chunk(&self, chunk: &Value) {
        dispatch(
            &self.inner.handlers,
            CallbackEvent::OutputChunk {
                chunk: chunk.clone(),
                run_id: self.inner.run_id,
            },
        )
        .await;
    }

    /// Report that attempt `attempt` failed with `error` and will be retried.
    pub async fn on_retry(&self, error: &Error, attempt: usize) {
        let error = error.to_string();
        self.inner.run.lock().add_event(RunEvent::with_kwargs(
            "retry",
            json!({ "attempt": attempt, "error": error }),
        ));
        dispatch(
            &self.inner.handlers,
            CallbackEvent::Retry {
                error,
                attempt,
                run_id: self.inner.run_id,
            },
        )
        .await;
    }

    pub async fn on_custom_event(&self, name: &str, data: Value) {
        dispatch(
            &self.inner.handlers,
            CallbackEvent::Custom {
                name: name.to_string(),
                data,
                run_id: self.inner.run_id,
                tags: self.inner.tags.clone(),
            },
        )
        .await;
    }
}

/// Owner of an in-progress run.
///
/// Exactly one of [`on_chain_end`](Self::on_chain_end) or
/// [`on_chain_error`](Self::on_chain_error) ends the run. If the manager is
/// dropped first, the run is ended with an abort error in the background.
#[derive(Debug)]
pub struct CallbackManagerForChainRun {
    shared: ChainRunRef,
    finished: bool,
}

impl Deref for CallbackManagerForChainRun {
    type Target = ChainRunRef;

    fn deref(&self) -> &ChainRunRef {
        &self.shared
    }
}

impl CallbackManagerForChainRun {
    /// A shareable handle to this run.
    pub fn shared(&self) -> ChainRunRef {
        self.shared.clone()
    }

    /// End the run with its output.
    pub async fn on_chain_end(mut self, outputs: Value) {
        let run = {
            let mut run = self.shared.inner.run.lock();
            run.set_outputs(outputs);
            run.clone()
        };
        let delivery =
            TerminalDelivery::new(self.shared.inner.handlers.clone(), CallbackEvent::RunEnd(run));
        self.finished = true;
        delivery.run().await;
    }

    /// End the run with an error.
    pub async fn on_chain_error(mut self, error: &Error) {
        let run = {
            let mut run = self.shared.inner.run.lock();
            run.set_error(error.to_string());
            run.clone()
        };
        let delivery = TerminalDelivery::new(
            self.shared.inner.handlers.clone(),
            CallbackEvent::RunError(run),
        );
        self.finished = true;
        delivery.run().await;
    }
}

impl Drop for CallbackManagerForChainRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let run = {
            let mut run = self.shared.inner.run.lock();
            run.set_error(Error::Aborted(AbortReason::Dropped).to_string());
            run.clone()
        };
        let handlers = self.shared.inner.handlers.clone();
        if handlers.is_empty() {
            return;
        }
        tracing::debug!(
            target: "runnable_core::callbacks",
            "Run {} ({}) dropped before completion",
            run.name,
            run.id,
        );
        enqueue_delivery(handlers, Arc::new(CallbackEvent::RunError(run)));
    }
}

/// Send a custom event to the handlers of the run currently executing.
///
/// Fails with [`Error::Scope`] when called outside any run.
pub async fn dispatch_custom_event(name: &str, data: Value) -> Result<()> {
    let config = get_current_config().ok_or_else(|| {
        Error::Scope("dispatch_custom_event called outside of a runnable execution".into())
    })?;
    let manager = CallbackManager::configure(config.callbacks.as_ref(), &[], &IndexMap::new());
    let Some(run_id) = manager.parent_run_id else {
        return Err(Error::Scope(
            "dispatch_custom_event requires a parent run".into(),
        ));
    };
    dispatch(
        &manager.handlers,
        CallbackEvent::Custom {
            name: name.to_string(),
            data,
            run_id,
            tags: manager.tags.clone(),
        },
    )
    .await;
    Ok(())
}
