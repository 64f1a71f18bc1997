//! Environment parsing shared by the `from_env()` constructors.

use std::str::FromStr;

use crate::error::AppError;

/// Read `name` and parse it, falling back to `default` when unset or blank.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': could not parse value"))
        }),
        _ => Ok(default),
    }
}

/// Like [`env_parse`], rejecting zero.
pub fn env_positive(name: &str, default: u64) -> Result<u64, AppError> {
    let value = env_parse(name, default)?;
    if value == 0 {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(value)
}

/// Comma-separated list, trimmed, empty items dropped.
pub fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
