//! Advisory lock keys.

use crate::id::ResourceId;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Name of an advisory lock held in shared storage.
///
/// Keys compare lexicographically; operations that need several locks
/// acquire them in that order.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    /// Lock guarding admission decisions for a serial group of a pipeline.
    pub fn serial_group(pipeline_id: ResourceId, group: &str) -> Self {
        Self(format!("serial-group:{}/{}", pipeline_id, group))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
