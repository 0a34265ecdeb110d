//! Keep-alive policy declared per compute operation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum retention of a cache entry after its last access.
///
/// Wire form: `{ "ttlSeconds": 1.5 }`. A zero TTL disables retention beyond
/// active references (dependents or live subscriptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAlive {
    ttl: Duration,
}

impl KeepAlive {
    /// No retention beyond active references.
    pub const NONE: KeepAlive = KeepAlive { ttl: Duration::ZERO };

    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True when entries are dropped as soon as nothing references them.
    pub fn is_none(&self) -> bool {
        self.ttl.is_zero()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeepAliveWire {
    ttl_seconds: f64,
}

impl Serialize for KeepAlive {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        KeepAliveWire {
            ttl_seconds: self.ttl.as_secs_f64(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeepAlive {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = KeepAliveWire::deserialize(deserializer)?;
        if !wire.ttl_seconds.is_finite() || wire.ttl_seconds < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "ttlSeconds must be a non-negative number, got {}",
                wire.ttl_seconds
            )));
        }
        Ok(Self::new(Duration::from_secs_f64(wire.ttl_seconds)))
    }
}
