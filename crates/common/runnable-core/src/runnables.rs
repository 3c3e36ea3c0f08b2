//! The runnable abstraction and its composers.
//!
//! [`Runnable`] is the unit of work. Composers build larger units from
//! smaller ones: [`RunnableSequence`] chains, [`RunnableParallel`] fans out,
//! [`RunnableRetry`] and [`RunnableWithFallbacks`] recover from failures,
//! and [`RunnableBinding`] pre-binds kwargs and config.

pub mod base;
pub mod binding;
pub mod branch;
pub mod config;
pub mod each;
pub mod fallbacks;
pub mod lambda;
pub mod parallel;
pub mod passthrough;
pub mod retry;
pub mod sequence;
pub mod utils;

pub use base::{
    BatchResults, DEFAULT_MAX_CONCURRENCY, DynRunnable, RunHandle, Runnable, RunnableValue,
    ValueRunnable, call_with_config, once_stream, transform_stream_with_config,
};
pub use binding::RunnableBinding;
pub use branch::{RunnableBranch, RunnableBranchFluentBuilder};
pub use config::{
    DEFAULT_RECURSION_LIMIT, RunnableConfig, ensure_config, get_callback_manager_for_config,
    get_config_list, merge_configs, patch_config,
};
pub use each::RunnableEach;
pub use fallbacks::RunnableWithFallbacks;
pub use lambda::RunnableLambda;
pub use parallel::RunnableParallel;
pub use passthrough::{
    PickKeys, RunnableAssign, RunnableAssignBuilder, RunnablePassthrough, RunnablePick,
};
pub use retry::{ErrorClassifier, FailedAttemptHook, RunnableRetry, RunnableRetryConfig};
pub use sequence::RunnableSequence;
pub use utils::{
    ChunkAggregator, concat_values, gather_with_concurrency, try_gather_with_concurrency,
};
