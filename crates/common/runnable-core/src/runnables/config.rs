//! Configuration for Runnables.
//!
//! This module provides `RunnableConfig` and the helpers that build, merge
//! and patch it at each nesting boundary.

use std::time::Duration;

use bon::builder;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::callbacks::{ArcCallbackHandler, CallbackManager, Callbacks};
use crate::context::get_current_config;
use crate::signal::AbortSignal;

/// Recursion ceiling used when a config does not set one.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Per-invocation options for a Runnable.
///
/// All methods that execute a runnable accept an optional config. Nested
/// calls inherit it field by field, with the child's values taking
/// precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableConfig {
    /// Tags for this call and any sub-calls. Used to filter runs.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Metadata for this call and any sub-calls.
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,

    /// Callbacks for this call and any sub-calls.
    #[serde(skip)]
    pub callbacks: Option<Callbacks>,

    /// Name for the run of this call. Defaults to the runnable's name.
    #[serde(default)]
    pub run_name: Option<String>,

    /// Id for the run of this call. Applies to this call only.
    #[serde(default)]
    pub run_id: Option<Uuid>,

    /// Maximum number of parallel calls made by batch and map composers.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Maximum nesting depth before a call fails. Unset means
    /// [`DEFAULT_RECURSION_LIMIT`].
    #[serde(default)]
    pub recursion_limit: Option<usize>,

    /// Nesting depth of the run this config is passed to.
    #[serde(default)]
    pub recursion_depth: usize,

    /// Runtime values for configurable attributes.
    #[serde(default)]
    pub configurable: IndexMap<String, Value>,

    /// Keyword arguments bound to the runnable receiving this config.
    #[serde(default)]
    pub kwargs: IndexMap<String, Value>,

    /// Cancellation signal shared by the whole call tree.
    #[serde(skip)]
    pub signal: Option<AbortSignal>,

    /// Deadline for the call. Turned into `signal` on entry.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: IndexMap::new(),
            callbacks: None,
            run_name: None,
            run_id: None,
            max_concurrency: None,
            recursion_limit: None,
            recursion_depth: 0,
            configurable: IndexMap::new(),
            kwargs: IndexMap::new(),
            signal: None,
            timeout: None,
        }
    }
}

impl RunnableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Add a single tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_metadata(mut self, metadata: IndexMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_callbacks(mut self, callbacks: impl Into<Callbacks>) -> Self {
        self.callbacks = Some(callbacks.into());
        self
    }

    /// Add one handler to whatever callbacks are already set.
    pub fn with_handler(mut self, handler: ArcCallbackHandler) -> Self {
        let extra = Callbacks::Handlers(vec![handler]);
        self.callbacks = Some(match self.callbacks.take() {
            Some(callbacks) => callbacks.merge(&extra),
            None => extra,
        });
        self
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.recursion_limit = Some(recursion_limit);
        self
    }

    /// The recursion limit in effect for this config.
    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit.unwrap_or(DEFAULT_RECURSION_LIMIT)
    }

    pub fn with_configurable(mut self, configurable: IndexMap<String, Value>) -> Self {
        self.configurable = configurable;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(&self) -> Option<&AbortSignal> {
        self.signal.as_ref()
    }

    /// Read a bound keyword argument.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Drop bound keyword arguments. Composers do this before calling their
    /// steps so kwargs stay with the unit they were bound to.
    pub fn without_kwargs(mut self) -> Self {
        self.kwargs.clear();
        self
    }
}

/// Resolve the config for a call.
///
/// Without an explicit config the ambient config of the enclosing run is
/// used, so nested calls attach to their parent. An explicit config is
/// merged over the ambient one. A `timeout` is converted into an abort
/// signal here.
pub fn ensure_config(config: Option<RunnableConfig>) -> RunnableConfig {
    let ambient = get_current_config().map(|mut ambient| {
        ambient.run_name = None;
        ambient
    });
    let mut config = match (ambient, config) {
        (Some(ambient), Some(config)) => merge_configs(vec![Some(ambient), Some(config)]),
        (Some(ambient), None) => ambient,
        (None, Some(config)) => config,
        (None, None) => RunnableConfig::default(),
    };
    if let Some(timeout) = config.timeout.take() {
        config.signal = Some(match &config.signal {
            Some(signal) => signal.child_with_timeout(timeout),
            None => AbortSignal::timeout(timeout),
        });
    }
    config
}

/// Expand one optional config into `length` configs for a batch.
///
/// A run id can only identify one run, so it is kept on the first config
/// only.
pub fn get_config_list(config: Option<RunnableConfig>, length: usize) -> Vec<RunnableConfig> {
    let config = ensure_config(config);
    if length > 1 && config.run_id.is_some() {
        tracing::warn!(
            target: "runnable_core::runnables",
            "Provided run_id will be used only for the first element of the batch."
        );
    }
    (0..length)
        .map(|i| {
            let mut item = config.clone();
            if i > 0 {
                item.run_id = None;
            }
            item
        })
        .collect()
}

/// Patch a config with updates.
///
/// Replacing callbacks clears `run_name` and `run_id`, which only apply to
/// the run the original callbacks were for.
#[builder]
pub fn patch_config(
    config: RunnableConfig,
    callbacks: Option<CallbackManager>,
    #[builder(into)] run_name: Option<String>,
    max_concurrency: Option<usize>,
    recursion_depth: Option<usize>,
    signal: Option<AbortSignal>,
) -> RunnableConfig {
    let mut config = config;
    if let Some(callbacks) = callbacks {
        config.callbacks = Some(Callbacks::Manager(callbacks));
        config.run_name = None;
        config.run_id = None;
    }
    if let Some(name) = run_name {
        config.run_name = Some(name);
    }
    if let Some(max) = max_concurrency {
        config.max_concurrency = Some(max);
    }
    if let Some(depth) = recursion_depth {
        config.recursion_depth = depth;
    }
    if let Some(signal) = signal {
        config.signal = Some(signal);
    }
    config
}

/// Merge multiple configs into one.
///
/// Later configs take precedence over earlier ones. Tags are unioned,
/// maps are merged key by key, callbacks are combined.
pub fn merge_configs(configs: Vec<Option<RunnableConfig>>) -> RunnableConfig {
    let mut result = RunnableConfig::default();

    for config in configs.into_iter().flatten() {
        for tag in config.tags {
            if !result.tags.contains(&tag) {
                result.tags.push(tag);
            }
        }
        result.metadata.extend(config.metadata);
        result.configurable.extend(config.configurable);
        result.kwargs.extend(config.kwargs);

        result.callbacks = match (result.callbacks.take(), config.callbacks) {
            (Some(base), Some(extra)) => Some(base.merge(&extra)),
            (base, extra) => extra.or(base),
        };

        if config.run_name.is_some() {
            result.run_name = config.run_name;
        }
        if config.run_id.is_some() {
            result.run_id = config.run_id;
        }
        if config.max_concurrency.is_some() {
            result.max_concurrency = config.max_concurrency;
        }
        if config.recursion_limit.is_some() {
            result.recursion_limit = config.recursion_limit;
        }
        result.recursion_depth = result.recursion_depth.max(config.recursion_depth);
        if config.signal.is_some() {
            result.signal = config.signal;
        }
        if config.timeout.is_some() {
            result.timeout = config.timeout;
        }
    }

    result
}

/// Get a callback manager configured from the given RunnableConfig.
pub fn get_callback_manager_for_config(config: &RunnableConfig) -> CallbackManager {
    CallbackManager::configure(config.callbacks.as_ref(), &config.tags, &config.metadata)
}
