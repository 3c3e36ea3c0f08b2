//! Process-wide settings.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable that attaches the console tracer to every run.
pub const DEBUG_ENV: &str = "RUNNABLE_DEBUG";

/// Environment variable controlling background callback delivery.
///
/// Set to `false` (or `0`) to await every handler inline.
pub const CALLBACKS_BACKGROUND_ENV: &str = "RUNNABLE_CALLBACKS_BACKGROUND";

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Enable or disable debug tracing for every run in the process.
pub fn set_debug(value: bool) {
    DEBUG.store(value, Ordering::SeqCst);
}

/// Whether debug tracing is on, either via [`set_debug`] or [`DEBUG_ENV`].
pub fn get_debug() -> bool {
    DEBUG.load(Ordering::SeqCst) || env_var_is_set(DEBUG_ENV)
}

/// Whether fire-and-forget handlers are delivered through the background queue.
pub fn callbacks_in_background() -> bool {
    match env::var(CALLBACKS_BACKGROUND_ENV) {
        Ok(value) => !is_falsy(&value),
        Err(_) => true,
    }
}

/// Check if an environment variable is set to a truthy value.
pub fn env_var_is_set(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => !value.is_empty() && !is_falsy(&value),
        Err(_) => false,
    }
}

fn is_falsy(value: &str) -> bool {
    matches!(value, "0" | "false" | "False" | "FALSE")
}
