use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or target as reported by the backend.
///
/// [`SnapshotVersion::min`] stands for "never seen by the server" and
/// [`SnapshotVersion::max`] bounds every real version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn min() -> Self {
        Self::new(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self::new(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}
