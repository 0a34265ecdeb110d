//! Push messages produced by a publication.

use crate::key::ComputationKey;
use crate::result::{CachedResult, Output, ProductionFailure, Version};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;

/// One `{key, version, value|error}` message destined for a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicationUpdate {
    pub key: ComputationKey,
    pub version: Version,
    pub output: Output,
}

impl PublicationUpdate {
    pub fn from_result(result: &CachedResult) -> Self {
        Self {
            key: result.key().clone(),
            version: result.version(),
            output: result.output().clone(),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.output.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&ProductionFailure> {
        self.output.as_ref().err()
    }
}

impl From<&Arc<CachedResult>> for PublicationUpdate {
    fn from(result: &Arc<CachedResult>) -> Self {
        Self::from_result(result)
    }
}

impl Serialize for PublicationUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PublicationUpdate", 3)?;
        state.serialize_field("key", &self.key)?;
        state.serialize_field("version", &self.version)?;
        match &self.output {
            Ok(value) => state.serialize_field("value", value)?,
            Err(failure) => state.serialize_field("error", failure)?,
        }
        state.end()
    }
}
