use chrono::{DateTime, Utc};

use crate::core::crypto::MsSinceEpoch;

impl<T: chrono::TimeZone> From<DateTime<T>> for MsSinceEpoch {
    fn from(value: DateTime<T>) -> Self {
        Self(value.timestamp_millis())
    }
}

impl MsSinceEpoch {
    /// `None` when the instant is outside the range chrono can represent.
    pub fn as_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}
