//! Callback handler trait and the events delivered to it.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::tracers::schemas::Run;

/// Observer of run lifecycle events.
///
/// Every hook has a no-op default. A hook that returns an error or panics is
/// logged and skipped; it never fails the run and never stops the remaining
/// handlers from seeing the event.
#[async_trait]
pub trait CallbackHandler: Send + Sync + Debug {
    /// Name used in log messages about this handler.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether the run waits for this handler before moving on.
    ///
    /// Handlers that return `false` are delivered through the background
    /// [`CallbackQueue`](super::CallbackQueue) and can be awaited with
    /// [`await_all_callbacks`](super::await_all_callbacks).
    fn awaits(&self) -> bool {
        false
    }

    async fn on_run_start(&self, run: &Run) -> Result<()> {
        let _ = run;
        Ok(())
    }

    async fn on_run_end(&self, run: &Run) -> Result<()> {
        let _ = run;
        Ok(())
    }

    async fn on_run_error(&self, run: &Run) -> Result<()> {
        let _ = run;
        Ok(())
    }

    /// A chunk produced by a streaming run, such as a new token from a model.
    async fn on_stream_chunk(
        &self,
        chunk: &Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    ) -> Result<()> {
        let _ = (chunk, run_id, parent_run_id);
        Ok(())
    }

    /// A chunk of a run's streamed output.
    async fn on_output_chunk(&self, chunk: &Value, run_id: Uuid) -> Result<()> {
        let _ = (chunk, run_id);
        Ok(())
    }

    /// A failed attempt is about to be retried.
    async fn on_retry(&self, error: &str, attempt: usize, run_id: Uuid) -> Result<()> {
        let _ = (error, attempt, run_id);
        Ok(())
    }

    async fn on_custom_event(
        &self,
        name: &str,
        data: &Value,
        run_id: Uuid,
        tags: &[String],
    ) -> Result<()> {
        let _ = (name, data, run_id, tags);
        Ok(())
    }
}

pub type ArcCallbackHandler = Arc<dyn CallbackHandler>;

/// An event routed to callback handlers.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    RunStart(Run),
    RunEnd(Run),
    RunError(Run),
    StreamChunk {
        chunk: Value,
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
    },
    OutputChunk {
        chunk: Value,
        run_id: Uuid,
    },
    Retry {
        error: String,
        attempt: usize,
        run_id: Uuid,
    },
    Custom {
        name: String,
        data: Value,
        run_id: Uuid,
        tags: Vec<String>,
    },
}

impl CallbackEvent {
    /// The hook this event is delivered to.
    pub fn hook_name(&self) -> &'static str {
        match self {
            CallbackEvent::RunStart(_) => "on_run_start",
            CallbackEvent::RunEnd(_) => "on_run_end",
            CallbackEvent::RunError(_) => "on_run_error",
            CallbackEvent::StreamChunk { .. } => "on_stream_chunk",
            CallbackEvent::OutputChunk { .. } => "on_output_chunk",
            CallbackEvent::Retry { .. } => "on_retry",
            CallbackEvent::Custom { .. } => "on_custom_event",
        }
    }

    /// Call the matching hook on `handler`.
    pub async fn deliver(&self, handler: &dyn CallbackHandler) -> Result<()> {
        match self {
            CallbackEvent::RunStart(run) => handler.on_run_start(run).await,
            CallbackEvent::RunEnd(run) => handler.on_run_end(run).await,
            CallbackEvent::RunError(run) => handler.on_run_error(run).await,
            CallbackEvent::StreamChunk {
                chunk,
                run_id,
                parent_run_id,
            } => handler.on_stream_chunk(chunk, *run_id, *parent_run_id).await,
            CallbackEvent::OutputChunk { chunk, run_id } => {
                handler.on_output_chunk(chunk, *run_id).await
            }
            CallbackEvent::Retry {
                error,
                attempt,
                run_id,
            } => handler.on_retry(error, *attempt, *run_id).await,
            CallbackEvent::Custom {
                name,
                data,
                run_id,
                tags,
            } => handler.on_custom_event(name, data, *run_id, tags).await,
        }
    }
}
