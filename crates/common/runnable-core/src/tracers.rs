//! Tracers: callback handlers that record or report runs.

pub mod event_stream;
pub mod root_listeners;
pub mod run_collector;
pub mod schemas;
pub mod stdout;

pub use event_stream::{EventData, EventFilter, EventStreamHandler, StreamEvent, stream_events};
pub use root_listeners::{Listener, Listeners, RootListenersTracer};
pub use run_collector::RunCollector;
pub use schemas::{Run, RunEvent, RunType};
pub use stdout::ConsoleCallbackHandler;
