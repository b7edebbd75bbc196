//! Environment variable helpers.
//!
//! Binaries read their database location and config path from the process
//! environment. These wrappers turn `std::env::var` failures into structured
//! errors that name the variable.

use std::str::FromStr;

use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error)]
#[error("Missing environment variable: {0}")]
pub struct MissingEnvVarError(pub String);

/// An environment variable is set but its value does not parse.
#[derive(Debug, Error)]
#[error("Invalid value for environment variable {name}: {value:?}")]
pub struct InvalidEnvVarError {
    /// Variable name.
    pub name: String,
    /// Raw value as found in the environment.
    pub value: String,
}

/// Reads an environment variable, returning a structured error if it's missing.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    std::env::var(name).map_err(|_| MissingEnvVarError(name.to_string()))
}

/// Reads an environment variable, falling back to `default` when unset or empty.
pub fn get_env_var_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

/// Reads and parses an optional environment variable.
///
/// Returns `Ok(None)` when the variable is unset, and an error when it is set
/// to something `T` cannot parse.
pub fn parse_env_var<T: FromStr>(name: &str) -> Result<Option<T>, InvalidEnvVarError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| InvalidEnvVarError {
                name: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_names_the_variable() {
        let err = get_env_var("SHARED_UTILS_TEST_DEFINITELY_UNSET").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: SHARED_UTILS_TEST_DEFINITELY_UNSET"
        );
    }

    #[test]
    fn fallback_used_when_unset() {
        let v = get_env_var_or("SHARED_UTILS_TEST_ALSO_UNSET", "series.db");
        assert_eq!(v, "series.db");
    }

    #[test]
    fn unset_optional_parses_to_none() {
        let v: Option<u64> = parse_env_var("SHARED_UTILS_TEST_UNSET_NUMBER").unwrap();
        assert!(v.is_none());
    }
}
