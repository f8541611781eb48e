//! Identifiers used across the broker.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Context identifier.
pub type ContextId = Uuid;

/// Snapshot identifier.
pub type SnapshotId = Uuid;

/// Engine handle of the global object; fixed by the protocol.
pub const GLOBAL_HANDLE: i64 = -1;

/// A remote object handle tagged with the connection generation that produced it.
///
/// Rendered as `"<generation>:<remote>"`, e.g. `"3:17"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    generation: u64,
    remote: i64,
}

impl ObjectHandle {
    #[must_use]
    pub const fn new(generation: u64, remote: i64) -> Self {
        Self { generation, remote }
    }

    /// Generation of the connection this handle was obtained on.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The engine's own handle number.
    #[must_use]
    pub const fn remote(&self) -> i64 {
        self.remote
    }

    /// Whether the handle is usable on a connection at `generation`.
    #[must_use]
    pub const fn is_live_in(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.remote)
    }
}

/// Handle string did not have the `<generation>:<remote>` shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid object handle: {0}")]
pub struct ParseHandleError(String);

impl FromStr for ObjectHandle {
    type Err = ParseHandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, remote) = s
            .split_once(':')
            .ok_or_else(|| ParseHandleError(s.to_string()))?;
        let generation = generation
            .parse()
            .map_err(|_| ParseHandleError(s.to_string()))?;
        let remote = remote.parse().map_err(|_| ParseHandleError(s.to_string()))?;
        Ok(Self { generation, remote })
    }
}

impl Serialize for ObjectHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
