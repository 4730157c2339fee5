//! Environment variable utilities
//!
//! Generic `env_get<T>` function for parsing environment variables with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use usrbio_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("USRBIO_WORKERS", 4);
//! let pin: bool = env_get_bool("USRBIO_PIN_REGIONS", false);
//! ```

use std::path::PathBuf;
use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_bool(&val),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Get a `:`-separated path list (like `PATH`). Empty entries are skipped.
pub fn env_get_paths(key: &str) -> Vec<PathBuf> {
    std::env::var(key)
        .map(|v| split_paths(&v))
        .unwrap_or_default()
}

fn parse_bool(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_paths(val: &str) -> Vec<PathBuf> {
    val.split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("USRBIO_NONEXISTENT_VAR_12345", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<usize> = env_get_opt("USRBIO_NONEXISTENT_VAR_12345");
        assert!(val.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("YES"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn test_split_paths() {
        let paths = split_paths("/3fs/stage::/mnt/b");
        assert_eq!(paths, vec![PathBuf::from("/3fs/stage"), PathBuf::from("/mnt/b")]);
    }
}
