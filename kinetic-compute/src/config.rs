//! Configuration for the compute cache.

use std::time::Duration;

use kinetic_core::{ConfigError, KeepAlive};

use crate::constants::{DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_ARGS};

/// Registry-wide defaults applied while operations are registered.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeConfig {
    /// Keep-alive applied to operations registered without an explicit one.
    pub default_keep_alive: KeepAlive,
    /// Calls with more arguments than this are rejected.
    pub max_args: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: KeepAlive::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            max_args: DEFAULT_MAX_ARGS,
        }
    }
}

impl ComputeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create ComputeConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KINETIC_DEFAULT_KEEP_ALIVE_SECS`: Keep-alive for operations without one (default: 0)
    /// - `KINETIC_MAX_ARGS`: Maximum arguments per call (default: 32)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_keep_alive = match std::env::var("KINETIC_DEFAULT_KEEP_ALIVE_SECS") {
            Ok(raw) => KeepAlive::new(Duration::from_secs(parse_env(
                "KINETIC_DEFAULT_KEEP_ALIVE_SECS",
                &raw,
            )?)),
            Err(_) => KeepAlive::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        };

        let max_args = match std::env::var("KINETIC_MAX_ARGS") {
            Ok(raw) => parse_env("KINETIC_MAX_ARGS", &raw)?,
            Err(_) => DEFAULT_MAX_ARGS,
        };

        Ok(Self {
            default_keep_alive,
            max_args,
        })
    }

    /// Set the keep-alive used for operations registered without one.
    pub fn with_default_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.default_keep_alive = keep_alive;
        self
    }

    /// Set the maximum number of arguments per call.
    pub fn with_max_args(mut self, max_args: usize) -> Self {
        self.max_args = max_args;
        self
    }
}

/// Parse an environment value, reporting the variable name on failure.
pub(crate) fn parse_env<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}
