pub mod base;
pub mod manager;
pub mod queue;

pub use base::{ArcCallbackHandler, CallbackEvent, CallbackHandler};

pub use manager::{
    CallbackManager, CallbackManagerForChainRun, Callbacks, ChainRunRef, ParentTrace, dispatch,
    dispatch_custom_event,
};

pub use queue::{CallbackQueue, await_all_callbacks};
