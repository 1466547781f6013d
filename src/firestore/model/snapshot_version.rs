use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or a whole remote snapshot, as reported by the
/// backend. `SnapshotVersion::min()` means "no version known".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Convenience constructor used by tests and by the loopback backend.
    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        ))
    }

    pub fn to_micros(&self) -> i64 {
        self.timestamp.seconds * 1_000_000 + i64::from(self.timestamp.nanos) / 1_000
    }

    /// Smallest version that sorts after this one.
    pub fn successor(&self) -> Self {
        let Timestamp { seconds, nanos } = self.timestamp;
        if nanos + 1 == 1_000_000_000 {
            Self::new(Timestamp::new(seconds + 1, 0))
        } else {
            Self::new(Timestamp::new(seconds, nanos + 1))
        }
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_first() {
        let v1 = SnapshotVersion::from_micros(1);
        assert!(SnapshotVersion::min() < v1);
        assert!(SnapshotVersion::min().is_min());
        assert!(v1 < SnapshotVersion::max());
    }
}
