//! Error types for KINETIC operations

use crate::identity::ChannelId;
use crate::result::ProductionFailure;
use thiserror::Error;

/// Compute cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    /// The producer failed. The failure is cached until the key is invalidated.
    #[error("Production failed: {0}")]
    Production(ProductionFailure),

    /// A production tried to depend on itself, directly or transitively.
    /// Never cached.
    #[error("Cyclic dependency detected: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("Invalid arguments for {operation}: {reason}")]
    InvalidArguments { operation: String, reason: String },

    /// The production task ended without reporting an outcome.
    #[error("Production of {key} was aborted")]
    ProductionAborted { key: String },
}

impl ComputeError {
    /// Shorthand for a producer-raised failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Production(ProductionFailure::new(message))
    }

    /// True for errors that must never be stored in the cache.
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Self::CyclicDependency { .. })
    }
}

impl From<ProductionFailure> for ComputeError {
    fn from(failure: ProductionFailure) -> Self {
        Self::Production(failure)
    }
}

/// Publisher/subscription bridge errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    /// The channel's connection is gone.
    #[error("Subscription closed for channel {channel}")]
    SubscriptionClosed { channel: ChannelId },

    #[error("Publication for {key} was removed")]
    PublicationRemoved { key: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Operation registered twice: {operation}")]
    DuplicateOperation { operation: String },

    #[error("Invalid operation name {operation:?}: {reason}")]
    InvalidOperationName { operation: String, reason: String },
}

/// Master error type for all KINETIC errors.
#[derive(Debug, Clone, Error)]
pub enum KineticError {
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type alias for KINETIC operations.
pub type KineticResult<T> = Result<T, KineticError>;

// =============================================================================
// TESTS
// =============================================================================
