use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Point in time with nanosecond precision, independent of any time zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        Self::from_date_time(Utc::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    pub fn from_date_time(value: DateTime<Utc>) -> Self {
        Self::new(value.timestamp(), value.timestamp_subsec_nanos() as i32)
    }

    /// Parses an RFC 3339 string such as `2024-01-01T00:00:00.000000001Z`.
    pub fn from_rfc3339(value: &str) -> FirestoreResult<Self> {
        DateTime::parse_from_rfc3339(value)
            .map(|parsed| Self::from_date_time(parsed.with_timezone(&Utc)))
            .map_err(|err| invalid_argument(format!("Invalid timestamp '{value}': {err}")))
    }

    pub fn to_rfc3339(&self) -> String {
        match Utc.timestamp_opt(self.seconds, self.nanos as u32).single() {
            Some(date_time) => date_time.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => format!("{}.{:09}s", self.seconds, self.nanos),
        }
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += i64::from(extra_seconds);
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}
