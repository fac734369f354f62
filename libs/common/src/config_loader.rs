//! Configuration lookup helpers
//! Resolve single values from an explicit source, the environment, or a fallback

use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Parse an environment variable, ignoring it (with a warning) when it does not parse
pub fn env_override<T>(env_var: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(env_var).ok()?;
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(val) => {
            debug!("Using {} from environment: {}", env_var, raw);
            Some(val)
        },
        Err(e) => {
            warn!("Failed to parse {} from environment: {}", env_var, e);
            None
        },
    }
}

/// Get configuration value with priority: explicit > ENV > default
///
/// # Arguments
/// * `explicit` - Value given directly (typically a command-line flag)
/// * `env_var` - Environment variable name to check
/// * `default` - Value taken from the loaded configuration
pub fn get_config_value<T>(explicit: Option<T>, env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    // Priority 1: explicit value
    if let Some(val) = explicit {
        return val;
    }

    // Priority 2: environment variable
    if let Some(val) = env_override(env_var) {
        return val;
    }

    // Priority 3: default
    default
}

/// Get optional value with priority: ENV > configured
pub fn env_first<T>(env_var: &str, configured: Option<T>) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    env_override(env_var).or(configured)
}
