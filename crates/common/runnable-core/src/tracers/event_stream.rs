//! Event stream tracer.
//!
//! [`stream_events`] runs a runnable in streaming mode with an
//! [`EventStreamHandler`] attached and yields every start, stream, end and
//! error event of the run tree as a flat stream of [`StreamEvent`]s, in the
//! order the events happened.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::callbacks::base::CallbackHandler;
use crate::error::Result;
use crate::runnables::{Runnable, RunnableConfig};
use crate::tracers::schemas::{Run, RunType};

/// Event name used for events sent with
/// [`dispatch_custom_event`](crate::callbacks::dispatch_custom_event).
pub const CUSTOM_EVENT: &str = "on_custom_event";

/// Payload of a [`StreamEvent`]. Which fields are set depends on the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Input of the run. Missing on the start event of a streaming run,
    /// whose input is only known once its input stream is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Data sent with a custom event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// One event of a run tree.
///
/// `event` is `on_<run type>_<start|stream|end|error>`, for example
/// `on_llm_stream`, or [`CUSTOM_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: String,
    /// Name of the run, or of the custom event.
    pub name: String,
    pub run_id: Uuid,
    /// Ancestors of the run, root first.
    pub parent_ids: Vec<Uuid>,
    pub tags: Vec<String>,
    pub metadata: IndexMap<String, Value>,
    pub data: EventData,
}

/// Which runs contribute events.
///
/// With no include list every run is included. Otherwise a run must match
/// at least one include list. Exclude lists are applied afterwards.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct EventFilter {
    include_names: Option<Vec<String>>,
    include_types: Option<Vec<RunType>>,
    include_tags: Option<Vec<String>>,
    exclude_names: Option<Vec<String>>,
    exclude_types: Option<Vec<RunType>>,
    exclude_tags: Option<Vec<String>>,
}

impl EventFilter {
    fn includes(&self, info: &RunInfo) -> bool {
        let has_includes = self.include_names.is_some()
            || self.include_types.is_some()
            || self.include_tags.is_some();
        let mut include = !has_includes;
        if let Some(names) = &self.include_names {
            include |= names.contains(&info.name);
        }
        if let Some(types) = &self.include_types {
            include |= types.contains(&info.run_type);
        }
        if let Some(tags) = &self.include_tags {
            include |= info.tags.iter().any(|tag| tags.contains(tag));
        }
        if let Some(names) = &self.exclude_names {
            include &= !names.contains(&info.name);
        }
        if let Some(types) = &self.exclude_types {
            include &= !types.contains(&info.run_type);
        }
        if let Some(tags) = &self.exclude_tags {
            include &= !info.tags.iter().any(|tag| tags.contains(tag));
        }
        include
    }
}

#[derive(Debug, Clone)]
struct RunInfo {
    name: String,
    run_type: RunType,
    tags: Vec<String>,
    metadata: IndexMap<String, Value>,
}

impl RunInfo {
    fn from_run(run: &Run) -> Self {
        Self {
            name: run.name.clone(),
            run_type: run.run_type,
            tags: run.tags.clone(),
            metadata: run.metadata.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    /// Open runs. Entries are removed when the run ends.
    runs: HashMap<Uuid, RunInfo>,
    /// Parent of every run seen so far. Kept after a run ends because a
    /// dropped parent can end before its children.
    parents: HashMap<Uuid, Option<Uuid>>,
}

impl HandlerState {
    fn parent_ids(&self, run_id: Uuid) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let mut current = run_id;
        while let Some(Some(parent)) = self.parents.get(&current) {
            if ids.contains(parent) {
                break;
            }
            ids.push(*parent);
            current = *parent;
        }
        ids.reverse();
        ids
    }
}

/// Handler that turns run callbacks into [`StreamEvent`]s.
///
/// Awaited inline, so each event is queued before the chunk or result that
/// caused it reaches the caller.
#[derive(Debug)]
pub struct EventStreamHandler {
    state: Mutex<HandlerState>,
    filter: EventFilter,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl EventStreamHandler {
    pub const NAME: &'static str = "event_stream_handler";

    /// Create a handler and the receiving end of its events.
    pub fn new(filter: EventFilter) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler = Self {
            state: Mutex::new(HandlerState::default()),
            filter,
            sender,
        };
        (handler, receiver)
    }

    fn send(&self, info: &RunInfo, run_id: Uuid, event: String, name: String, data: EventData) {
        if !self.filter.includes(info) {
            return;
        }
        let parent_ids = self.state.lock().parent_ids(run_id);
        let event = StreamEvent {
            event,
            name,
            run_id,
            parent_ids,
            tags: info.tags.clone(),
            metadata: info.metadata.clone(),
            data,
        };
        if self.sender.send(event).is_err() {
            tracing::debug!(
                target: "runnable_core::tracers",
                "Event stream receiver dropped, discarding event for run {}",
                run_id,
            );
        }
    }

    fn finish(&self, run: &Run, phase: &str, data: EventData) {
        let info = self
            .state
            .lock()
            .runs
            .remove(&run.id)
            .unwrap_or_else(|| RunInfo::from_run(run));
        let event = format!("on_{}_{phase}", info.run_type);
        self.send(&info, run.id, event, info.name.clone(), data);
    }
}

fn non_null(value: &Value) -> Option<Value> {
    (!value.is_null()).then(|| value.clone())
}

#[async_trait]
impl CallbackHandler for EventStreamHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn awaits(&self) -> bool {
        true
    }

    async fn on_run_start(&self, run: &Run) -> Result<()> {
        let info = RunInfo::from_run(run);
        {
            let mut state = self.state.lock();
            state.runs.insert(run.id, info.clone());
            state.parents.insert(run.id, run.parent_run_id);
        }
        let data = EventData {
            input: non_null(&run.inputs),
            ..EventData::default()
        };
        let event = format!("on_{}_start", info.run_type);
        self.send(&info, run.id, event, info.name.clone(), data);
        Ok(())
    }

    async fn on_output_chunk(&self, chunk: &Value, run_id: Uuid) -> Result<()> {
        let Some(info) = self.state.lock().runs.get(&run_id).cloned() else {
            return Ok(());
        };
        let data = EventData {
            chunk: Some(chunk.clone()),
            ..EventData::default()
        };
        let event = format!("on_{}_stream", info.run_type);
        self.send(&info, run_id, event, info.name.clone(), data);
        Ok(())
    }

    async fn on_run_end(&self, run: &Run) -> Result<()> {
        let data = EventData {
            input: non_null(&run.inputs),
            output: run.outputs.clone(),
            ..EventData::default()
        };
        self.finish(run, "end", data);
        Ok(())
    }

    async fn on_run_error(&self, run: &Run) -> Result<()> {
        let data = EventData {
            input: non_null(&run.inputs),
            error: run.error.clone(),
            ..EventData::default()
        };
        self.finish(run, "error", data);
        Ok(())
    }

    async fn on_custom_event(
        &self,
        name: &str,
        data: &Value,
        run_id: Uuid,
        _tags: &[String],
    ) -> Result<()> {
        let Some(info) = self.state.lock().runs.get(&run_id).cloned() else {
            return Ok(());
        };
        let data = EventData {
            custom: Some(data.clone()),
            ..EventData::default()
        };
        self.send(&info, run_id, CUSTOM_EVENT.to_string(), name.to_string(), data);
        Ok(())
    }
}

/// Stream `runnable` on `input` and yield the events of every run in the
/// tree instead of its output.
///
/// Only runs driven through the streaming path emit `stream` events; a unit
/// that is invoked emits its start and end events only. If the run fails,
/// the events produced so far are yielded and then the error.
pub fn stream_events<'a, R>(
    runnable: &'a R,
    input: R::Input,
    config: Option<RunnableConfig>,
    filter: EventFilter,
) -> BoxStream<'a, Result<StreamEvent>>
where
    R: Runnable + ?Sized,
{
    let (handler, mut receiver) = EventStreamHandler::new(filter);
    let config = config.unwrap_or_default().with_handler(Arc::new(handler));

    Box::pin(async_stream::stream! {
        let mut output = runnable.stream(input, Some(config));
        loop {
            let next = output.next().await;
            while let Ok(event) = receiver.try_recv() {
                yield Ok(event);
            }
            match next {
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    drop(output);
                    while let Ok(event) = receiver.try_recv() {
                        yield Ok(event);
                    }
                    yield Err(error);
                    return;
                }
                None => break,
            }
        }
        drop(output);
        while let Ok(event) = receiver.try_recv() {
            yield Ok(event);
        }
    })
}
