//! Named constants for the transport layer.

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 5006;

/// Default bind host.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Seconds between server pings on an idle WebSocket.
pub const DEFAULT_WS_KEEP_ALIVE_SECS: u64 = 15;

/// Largest inbound WebSocket message accepted, in bytes.
pub const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Outbound frames buffered per connection before delivery waits.
pub const DEFAULT_WS_OUTBOUND_BUFFER: usize = 256;

/// Milliseconds between invalidations of the sample `time` operation.
pub const DEFAULT_TIME_TICK_MS: u64 = 1000;

/// Header carrying the session token for HTTP invocations.
pub const SESSION_HEADER: &str = "x-session-id";

/// CORS preflight cache duration.
pub const CORS_MAX_AGE_SECS: u64 = 86400;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "kinetic_api=debug,kinetic_compute=info,kinetic_bridge=info,info";
