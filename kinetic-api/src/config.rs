//! API Configuration Module
//!
//! Server and transport settings loaded from environment variables with
//! defaults suitable for development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use kinetic_core::ConfigError;

use crate::constants::{
    DEFAULT_BIND_HOST, DEFAULT_PORT, DEFAULT_TIME_TICK_MS, DEFAULT_WS_KEEP_ALIVE_SECS,
    DEFAULT_WS_MAX_MESSAGE_BYTES, DEFAULT_WS_OUTBOUND_BUFFER,
};

// ============================================================================
// SERVER CONFIGURATION
// ============================================================================

/// Listener, CORS and sample-service settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,

    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Interval at which the sample `time` operation is invalidated.
    pub time_tick: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
            time_tick: Duration::from_millis(DEFAULT_TIME_TICK_MS),
        }
    }
}

impl ServerConfig {
    /// Create ServerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KINETIC_API_BIND`: Host to bind (default: 0.0.0.0)
    /// - `PORT` or `KINETIC_API_PORT`: Port to bind (default: 5006)
    /// - `KINETIC_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `KINETIC_TIME_TICK_MS`: Invalidation period of `time` (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_host =
            std::env::var("KINETIC_API_BIND").unwrap_or_else(|_| DEFAULT_BIND_HOST.to_string());

        let port = match std::env::var("PORT").or_else(|_| std::env::var("KINETIC_API_PORT")) {
            Ok(raw) => parse_env("KINETIC_API_PORT", &raw)?,
            Err(_) => DEFAULT_PORT,
        };

        let cors_origins = std::env::var("KINETIC_CORS_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .unwrap_or_default();

        let time_tick = match std::env::var("KINETIC_TIME_TICK_MS") {
            Ok(raw) => Duration::from_millis(parse_positive("KINETIC_TIME_TICK_MS", &raw)?),
            Err(_) => Duration::from_millis(DEFAULT_TIME_TICK_MS),
        };

        Ok(Self {
            bind_host,
            port,
            cors_origins,
            time_tick,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_time_tick(mut self, time_tick: Duration) -> Self {
        self.time_tick = time_tick;
        self
    }

    /// Check if running in production mode (strict CORS).
    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }

    /// Resolve the listener address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "KINETIC_API_BIND".to_string(),
                value: addr.clone(),
                reason: e.to_string(),
            })
    }
}

// ============================================================================
// TRANSPORT CONFIGURATION
// ============================================================================

/// Per-connection WebSocket settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Period of server pings.
    pub keep_alive: Duration,
    /// Largest inbound message accepted.
    pub max_message_bytes: usize,
    /// Outbound frames buffered before a delivery waits for the writer.
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(DEFAULT_WS_KEEP_ALIVE_SECS),
            max_message_bytes: DEFAULT_WS_MAX_MESSAGE_BYTES,
            outbound_buffer: DEFAULT_WS_OUTBOUND_BUFFER,
        }
    }
}

impl TransportConfig {
    /// Create TransportConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KINETIC_WS_KEEP_ALIVE_SECS`: Ping period (default: 15)
    /// - `KINETIC_WS_MAX_MESSAGE_BYTES`: Inbound message limit (default: 16384)
    /// - `KINETIC_WS_OUTBOUND_BUFFER`: Outbound frame buffer (default: 256)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let keep_alive = match std::env::var("KINETIC_WS_KEEP_ALIVE_SECS") {
            Ok(raw) => Duration::from_secs(parse_positive("KINETIC_WS_KEEP_ALIVE_SECS", &raw)?),
            Err(_) => defaults.keep_alive,
        };

        let max_message_bytes = match std::env::var("KINETIC_WS_MAX_MESSAGE_BYTES") {
            Ok(raw) => parse_positive("KINETIC_WS_MAX_MESSAGE_BYTES", &raw)?,
            Err(_) => defaults.max_message_bytes,
        };

        let outbound_buffer = match std::env::var("KINETIC_WS_OUTBOUND_BUFFER") {
            Ok(raw) => parse_positive("KINETIC_WS_OUTBOUND_BUFFER", &raw)?,
            Err(_) => defaults.outbound_buffer,
        };

        Ok(Self {
            keep_alive,
            max_message_bytes,
            outbound_buffer,
        })
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.outbound_buffer = outbound_buffer;
        self
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect()
}

fn parse_env<T>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let value: T = parse_env(field, raw)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
