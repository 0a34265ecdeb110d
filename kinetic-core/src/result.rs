//! Cached results and their versioning.

use crate::identity::Timestamp;
use crate::key::ComputationKey;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Per-entry version number. Strictly increases with every recomputation of
/// a live entry; a fresh entry (first production, or after eviction) starts
/// at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The version before any production happened.
    pub const ZERO: Version = Version(0);

    /// Wrap a raw version number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The next version.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The raw number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Whether a cache entry may be served as fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Invalidated,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// A failure raised by a producer, cached like a value.
///
/// Repeated calls for the same key receive this failure again without
/// re-running the producer, until the key is invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionFailure {
    /// Human-readable failure message.
    pub message: String,
    /// Key of the nested call the failure originated from, when it was not
    /// raised by this producer itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
}

impl ProductionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_key: None,
        }
    }

    /// Attribute the failure to a nested call.
    pub fn from_dependency(key: &ComputationKey, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_key: Some(key.encoded().to_string()),
        }
    }
}

impl fmt::Display for ProductionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source_key {
            Some(source) => write!(f, "{} (from {})", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of one production: the value or the cached failure.
pub type Output = Result<Value, ProductionFailure>;

/// One produced result for a key. Immutable once built; a recomputation
/// creates a new `CachedResult` with a higher version.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    key: ComputationKey,
    version: Version,
    output: Output,
    dependencies: Vec<ComputationKey>,
    produced_at: Timestamp,
}

impl CachedResult {
    pub fn new(
        key: ComputationKey,
        version: Version,
        output: Output,
        dependencies: Vec<ComputationKey>,
    ) -> Self {
        Self {
            key,
            version,
            output,
            dependencies,
            produced_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &ComputationKey {
        &self.key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    /// The produced value, if production succeeded.
    pub fn value(&self) -> Option<&Value> {
        self.output.as_ref().ok()
    }

    /// The cached failure, if production failed.
    pub fn failure(&self) -> Option<&ProductionFailure> {
        self.output.as_ref().err()
    }

    pub fn is_failure(&self) -> bool {
        self.output.is_err()
    }

    /// Keys this result read while it was produced.
    pub fn dependencies(&self) -> &[ComputationKey] {
        &self.dependencies
    }

    pub fn produced_at(&self) -> Timestamp {
        self.produced_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_ordering() {
        let v1 = Version::ZERO.next();
        let v2 = v1.next();
        assert!(v2 > v1);
        assert_eq!(v1.get(), 1);
        assert_eq!(v2.to_string(), "v2");
    }

    #[test]
    fn test_version_next_saturates() {
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
    }

    #[test]
    fn test_cached_result_accessors() {
        let key = ComputationKey::new("sum", vec![json!(2), json!(3)]);
        let ok = CachedResult::new(key.clone(), Version::new(1), Ok(json!(5)), vec![]);
        assert_eq!(ok.value(), Some(&json!(5)));
        assert!(!ok.is_failure());

        let failed = CachedResult::new(
            key,
            Version::new(2),
            Err(ProductionFailure::new("boom")),
            vec![],
        );
        assert!(failed.is_failure());
        assert_eq!(failed.failure().map(|f| f.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_failure_display_names_source() {
        let key = ComputationKey::new("time", vec![]);
        let failure = ProductionFailure::from_dependency(&key, "clock unavailable");
        assert_eq!(failure.to_string(), "clock unavailable (from time())");
    }
}
