use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::callbacks::base::CallbackHandler;
use crate::error::Result;
use crate::tracers::schemas::{Run, RunType};

/// Handler that keeps a copy of every run it sees.
///
/// Finished runs land in [`runs`](Self::runs) in completion order;
/// [`trees`](Self::trees) rebuilds the parent/child structure.
#[derive(Debug)]
pub struct RunCollector {
    awaits: bool,
    started: Mutex<Vec<Run>>,
    traced_runs: Mutex<Vec<Run>>,
}

impl Default for RunCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCollector {
    /// A collector the run awaits inline.
    pub fn new() -> Self {
        Self {
            awaits: true,
            started: Mutex::new(Vec::new()),
            traced_runs: Mutex::new(Vec::new()),
        }
    }

    /// A collector delivered through the background queue.
    pub fn background() -> Self {
        Self {
            awaits: false,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.traced_runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traced_runs.lock().is_empty()
    }

    pub fn clear(&self) {
        self.started.lock().clear();
        self.traced_runs.lock().clear();
    }

    /// Finished runs, in the order they finished.
    pub fn runs(&self) -> Vec<Run> {
        self.traced_runs.lock().clone()
    }

    /// Runs as they looked when they started.
    pub fn started_runs(&self) -> Vec<Run> {
        self.started.lock().clone()
    }

    pub fn latest_run(&self) -> Option<Run> {
        self.traced_runs.lock().last().cloned()
    }

    pub fn runs_by_type(&self, run_type: RunType) -> Vec<Run> {
        self.filter(|r| r.run_type == run_type)
    }

    pub fn runs_by_name(&self, name: &str) -> Vec<Run> {
        self.filter(|r| r.name == name)
    }

    pub fn errored_runs(&self) -> Vec<Run> {
        self.filter(|r| r.error.is_some())
    }

    pub fn successful_runs(&self) -> Vec<Run> {
        self.filter(|r| r.error.is_none() && r.end_time.is_some())
    }

    fn filter(&self, predicate: impl Fn(&Run) -> bool) -> Vec<Run> {
        self.traced_runs
            .lock()
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Root runs with their descendants nested in `child_runs`, ordered by
    /// dotted order.
    pub fn trees(&self) -> Vec<Run> {
        let mut runs = self.runs();
        runs.sort_by(|a, b| a.dotted_order.cmp(&b.dotted_order));

        let mut children: HashMap<Uuid, Vec<Run>> = HashMap::new();
        let mut roots = Vec::new();
        let known: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
        for run in runs {
            match run.parent_run_id {
                Some(parent) if known.contains(&parent) => {
                    children.entry(parent).or_default().push(run);
                }
                _ => roots.push(run),
            }
        }

        fn attach(run: &mut Run, children: &mut HashMap<Uuid, Vec<Run>>) {
            if let Some(mut kids) = children.remove(&run.id) {
                for kid in &mut kids {
                    attach(kid, children);
                }
                run.child_runs = kids;
            }
        }
        for root in &mut roots {
            attach(root, &mut children);
        }
        roots
    }
}

#[async_trait]
impl CallbackHandler for RunCollector {
    fn name(&self) -> &str {
        "run_collector_callback_handler"
    }

    fn awaits(&self) -> bool {
        self.awaits
    }

    async fn on_run_start(&self, run: &Run) -> Result<()> {
        self.started.lock().push(run.clone());
        Ok(())
    }

    async fn on_run_end(&self, run: &Run) -> Result<()> {
        self.traced_runs.lock().push(run.clone());
        Ok(())
    }

    async fn on_run_error(&self, run: &Run) -> Result<()> {
        self.traced_runs.lock().push(run.clone());
        Ok(())
    }
}
