//! Configuration read from `MIL_*` environment variables.

use tracing::warn;

/// Enables eager constant folding in the builder. Defaults to on.
pub const EAGER_FOLD: &str = "MIL_EAGER_FOLD";

/// Maximum number of iterations of a `while_loop` when it is evaluated.
pub const MAX_LOOP_ITERATIONS: &str = "MIL_MAX_LOOP_ITERATIONS";

/// Record ops a backend cannot lower instead of failing. Defaults to off.
pub const SKIP_UNSUPPORTED: &str = "MIL_SKIP_UNSUPPORTED";

pub const DEFAULT_MAX_LOOP_ITERATIONS: usize = 1_000_000;

/// Interpret a string value such as "1" or "no" as a boolean, or return
/// `None` if it is not recognized.
pub fn str_as_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    str_as_bool(&value).unwrap_or_else(|| {
        warn!(var = name, value = %value, "unrecognized boolean value");
        default
    })
}

/// Return the numeric value of an environment variable, or `default` if it
/// is unset or not a valid number.
pub fn env_usize(name: &str, default: usize) -> usize {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    value.trim().parse().unwrap_or_else(|_| {
        warn!(var = name, value = %value, "unrecognized numeric value");
        default
    })
}

/// Iteration limit for evaluating loops.
pub fn max_loop_iterations() -> usize {
    env_usize(MAX_LOOP_ITERATIONS, DEFAULT_MAX_LOOP_ITERATIONS)
}
