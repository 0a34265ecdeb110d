//! Configuration for the publisher.

use kinetic_core::{ConfigError, PublisherId};
use uuid::Uuid;

/// Publisher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Identity announced to every connection.
    pub publisher_id: PublisherId,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            publisher_id: PublisherId::new(),
        }
    }
}

impl BridgeConfig {
    /// Create BridgeConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KINETIC_PUBLISHER_ID`: UUID announced as the publisher id (default: random UUIDv7)
    pub fn from_env() -> Result<Self, ConfigError> {
        let publisher_id = match std::env::var("KINETIC_PUBLISHER_ID") {
            Ok(raw) => parse_publisher_id(&raw)?,
            Err(_) => PublisherId::new(),
        };
        Ok(Self { publisher_id })
    }

    pub fn with_publisher_id(mut self, publisher_id: PublisherId) -> Self {
        self.publisher_id = publisher_id;
        self
    }
}

fn parse_publisher_id(raw: &str) -> Result<PublisherId, ConfigError> {
    Uuid::parse_str(raw.trim())
        .map(PublisherId::from_uuid)
        .map_err(|e| ConfigError::InvalidValue {
            field: "KINETIC_PUBLISHER_ID".to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
}
