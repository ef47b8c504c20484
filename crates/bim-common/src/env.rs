//! Typed access to environment variables
//!
//! A value that is present but malformed is an error; only an unset (or
//! blank) variable falls back to the default.

use crate::error::{BimError, Result};
use std::str::FromStr;

/// Read `key`, returning `None` when unset or empty.
pub fn var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Parse `key` into `T`, returning `None` when unset.
pub fn parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BimError::invalid_value(key, value)),
        None => Ok(None),
    }
}

/// Parse `key` into `T`, falling back to `default` when unset.
pub fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    Ok(parse(key)?.unwrap_or(default))
}

/// Parse a boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`).
pub fn flag(key: &str, default: bool) -> Result<bool> {
    match var(key) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(BimError::invalid_value(key, value)),
        },
        None => Ok(default),
    }
}
