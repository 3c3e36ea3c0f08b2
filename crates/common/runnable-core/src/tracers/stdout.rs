use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use parking_lot::Mutex;

use crate::callbacks::base::CallbackHandler;
use crate::error::Result;
use crate::tracers::schemas::Run;

const MILLISECONDS_IN_SECOND: f64 = 1000.0;

pub fn try_json_stringify(obj: &Value, fallback: &str) -> String {
    serde_json::to_string_pretty(obj).unwrap_or_else(|_| fallback.to_string())
}

pub fn elapsed(run: &Run) -> String {
    if let Some(end_time) = run.end_time {
        let duration = end_time.signed_duration_since(run.start_time);
        let seconds = duration.num_milliseconds() as f64 / MILLISECONDS_IN_SECOND;
        if seconds < 1.0 {
            format!("{:.0}ms", seconds * MILLISECONDS_IN_SECOND)
        } else {
            format!("{:.2}s", seconds)
        }
    } else {
        "N/A".to_string()
    }
}

/// Tracer that logs every run through `tracing`.
///
/// Installed automatically on every run when debug mode is on
/// (see [`set_debug`](crate::globals::set_debug)).
#[derive(Debug, Default)]
pub struct ConsoleCallbackHandler {
    run_map: Mutex<HashMap<Uuid, (Option<Uuid>, String)>>,
}

impl ConsoleCallbackHandler {
    pub const NAME: &'static str = "console_callback_handler";

    pub fn new() -> Self {
        Self::default()
    }

    fn breadcrumbs(&self, run: &Run) -> String {
        let run_map = self.run_map.lock();
        let mut crumbs = vec![format!("{}:{}", run.run_type, run.name)];
        let mut parent = run.parent_run_id;
        while let Some(id) = parent {
            let Some((next, label)) = run_map.get(&id) else {
                break;
            };
            crumbs.push(label.clone());
            parent = *next;
        }
        crumbs.reverse();
        crumbs.join(" > ")
    }
}

#[async_trait]
impl CallbackHandler for ConsoleCallbackHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn awaits(&self) -> bool {
        true
    }

    async fn on_run_start(&self, run: &Run) -> Result<()> {
        self.run_map.lock().insert(
            run.id,
            (run.parent_run_id, format!("{}:{}", run.run_type, run.name)),
        );
        tracing::info!(
            target: "runnable_core::tracers",
            "[{}/start] [{}] Entering run with input:\n{}",
            run.run_type,
            self.breadcrumbs(run),
            try_json_stringify(&run.inputs, "[inputs]"),
        );
        Ok(())
    }

    async fn on_run_end(&self, run: &Run) -> Result<()> {
        let outputs = run.outputs.clone().unwrap_or_default();
        tracing::info!(
            target: "runnable_core::tracers",
            "[{}/end] [{}] [{}] Exiting run with output:\n{}",
            run.run_type,
            self.breadcrumbs(run),
            elapsed(run),
            try_json_stringify(&outputs, "[outputs]"),
        );
        self.run_map.lock().remove(&run.id);
        Ok(())
    }

    async fn on_run_error(&self, run: &Run) -> Result<()> {
        tracing::info!(
            target: "runnable_core::tracers",
            "[{}/error] [{}] [{}] Run errored with error:\n{}",
            run.run_type,
            self.breadcrumbs(run),
            elapsed(run),
            run.error.as_deref().unwrap_or("[error]"),
        );
        self.run_map.lock().remove(&run.id);
        Ok(())
    }

    async fn on_retry(&self, error: &str, attempt: usize, run_id: Uuid) -> Result<()> {
        tracing::debug!(
            target: "runnable_core::tracers",
            "[retry] Run {} retrying after attempt {} failed: {}",
            run_id,
            attempt,
            error,
        );
        Ok(())
    }
}
