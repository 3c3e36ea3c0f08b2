//! Runnable Core - composable async units of work with callback tracing.
//!
//! This crate provides:
//! - The [`Runnable`] trait: invoke, batch, stream and transform with a
//!   shared config, cancellation and recursion limit
//! - Composers: sequences, parallel maps, branches, bindings, retry and
//!   fallbacks
//! - Callback dispatch with run records, parent/child correlation and a
//!   background delivery queue that can be drained
//! - Task-scoped context variables visible to nested runs
//!
//! # Architecture
//!
//! - **Runnables layer** ([`runnables`]): the trait, lifecycle helpers and
//!   composers
//! - **Callbacks layer** ([`callbacks`]): handlers, managers and the
//!   background queue
//! - **Tracers layer** ([`tracers`]): run records and handlers that collect
//!   or report them
//! - **Context layer** ([`context`], [`signal`]): run scopes and cooperative
//!   cancellation
//!
//! Small collaborator units ([`prompts`], [`language_models`],
//! [`output_parsers`]) make it possible to build and test realistic
//! pipelines without a real model.

pub mod callbacks;
pub mod context;
pub mod error;
pub mod globals;
pub mod language_models;
pub mod messages;
pub mod output_parsers;
pub mod prompts;
pub mod runnables;
pub mod signal;
pub mod tracers;

// Re-export error types
pub use error::{AbortReason, Error, Result};

// Re-export runnable types
pub use runnables::{
    BatchResults, DynRunnable, ErrorClassifier, RunHandle, Runnable, RunnableBinding,
    RunnableBranch, RunnableConfig, RunnableEach, RunnableLambda, RunnableParallel,
    RunnablePassthrough, RunnableRetry, RunnableRetryConfig, RunnableSequence,
    RunnableWithFallbacks,
};

// Re-export callback types
pub use callbacks::{
    CallbackHandler, CallbackManager, CallbackQueue, Callbacks, await_all_callbacks,
    dispatch_custom_event,
};

// Re-export context and cancellation
pub use context::{get_context_variable, run_in_context, set_context_variable};
pub use signal::AbortSignal;

// Re-export tracer types
pub use tracers::{EventFilter, Listeners, Run, RunCollector, RunType, StreamEvent};

// Re-export global functions
pub use globals::{get_debug, set_debug};

// Re-export collaborator fakes
pub use language_models::FakeListChatModel;
pub use messages::{AIMessage, AIMessageChunk};
pub use output_parsers::StrOutputParser;
pub use prompts::PromptTemplate;
