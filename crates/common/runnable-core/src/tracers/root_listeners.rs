//! Tracer that calls listener functions on root run start, end, and error.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::callbacks::base::CallbackHandler;
use crate::error::Result;
use crate::tracers::schemas::Run;

/// A function called with a snapshot of the root run.
pub type Listener = Arc<dyn Fn(&Run) + Send + Sync>;

/// Listener functions registered through `with_listeners`.
#[derive(Clone, Default)]
pub struct Listeners {
    pub on_start: Option<Listener>,
    pub on_end: Option<Listener>,
    pub on_error: Option<Listener>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_start", &self.on_start.as_ref().map(|_| "Listener"))
            .field("on_end", &self.on_end.as_ref().map(|_| "Listener"))
            .field("on_error", &self.on_error.as_ref().map(|_| "Listener"))
            .finish()
    }
}

impl Listeners {
    pub fn on_start(mut self, listener: impl Fn(&Run) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(listener));
        self
    }

    pub fn on_end(mut self, listener: impl Fn(&Run) + Send + Sync + 'static) -> Self {
        self.on_end = Some(Arc::new(listener));
        self
    }

    pub fn on_error(mut self, listener: impl Fn(&Run) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(listener));
        self
    }
}

/// Calls [`Listeners`] for the first run it sees and ignores its children.
///
/// A fresh tracer is created for every invocation, so the first run started
/// is the root of that invocation.
#[derive(Debug)]
pub struct RootListenersTracer {
    listeners: Listeners,
    root_id: Mutex<Option<Uuid>>,
}

impl RootListenersTracer {
    pub fn new(listeners: Listeners) -> Self {
        Self {
            listeners,
            root_id: Mutex::new(None),
        }
    }

    pub fn root_id(&self) -> Option<Uuid> {
        *self.root_id.lock()
    }

    fn is_root(&self, run: &Run) -> bool {
        self.root_id() == Some(run.id)
    }
}

#[async_trait]
impl CallbackHandler for RootListenersTracer {
    fn name(&self) -> &str {
        "root_listeners_tracer"
    }

    fn awaits(&self) -> bool {
        true
    }

    async fn on_run_start(&self, run: &Run) -> Result<()> {
        {
            let mut root_id = self.root_id.lock();
            if root_id.is_some() {
                return Ok(());
            }
            *root_id = Some(run.id);
        }
        if let Some(listener) = &self.listeners.on_start {
            listener(run);
        }
        Ok(())
    }

    async fn on_run_end(&self, run: &Run) -> Result<()> {
        if self.is_root(run)
            && let Some(listener) = &self.listeners.on_end
        {
            listener(run);
        }
        Ok(())
    }

    async fn on_run_error(&self, run: &Run) -> Result<()> {
        if self.is_root(run)
            && let Some(listener) = &self.listeners.on_error
        {
            listener(run);
        }
        Ok(())
    }
}
