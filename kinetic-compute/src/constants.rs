//! Constants for the compute cache
//!
//! Defaults for configuration values that can be overridden from the
//! environment.

// ============================================================================
// KEEP-ALIVE
// ============================================================================

/// Default interval between keep-alive sweeps in milliseconds (1 second)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default keep-alive for operations registered without one (seconds)
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 0;

// ============================================================================
// REGISTRY
// ============================================================================

/// Maximum number of arguments accepted for a single call
pub const DEFAULT_MAX_ARGS: usize = 32;

/// Characters that may not appear in an operation name because they are
/// part of the canonical key encoding
pub const RESERVED_NAME_CHARS: &[char] = &['(', ')', '#', ',', '"'];
