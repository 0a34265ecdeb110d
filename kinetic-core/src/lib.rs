//! KINETIC Core - Shared Data Model
//!
//! Pure data structures shared by the compute cache, the publication bridge
//! and the transport layer: computation keys, versioned results, keep-alive
//! policies, push updates and error kinds. No runtime behavior lives here.

pub mod error;
pub mod identity;
pub mod key;
pub mod policy;
pub mod result;
pub mod update;

pub use error::{
    BridgeError, BridgeResult, ComputeError, ComputeResult, ConfigError, KineticError,
    KineticResult,
};
pub use identity::{ChannelId, ConnectionId, PublicationId, PublisherId, Timestamp};
pub use key::{ComputationKey, Session};
pub use policy::KeepAlive;
pub use result::{CachedResult, Output, ProductionFailure, Validity, Version};
pub use update::PublicationUpdate;

/// Argument and result values are plain JSON.
pub use serde_json::Value;
