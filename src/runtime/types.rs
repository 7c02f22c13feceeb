//! Host types with a dedicated VM representation.

use crate::runtime::placeholder::DATE_TOKEN;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::time::SystemTime;

/// A point in time that marshals into a VM `Date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(pub DateTime<Utc>);

impl Date {
    /// Milliseconds since the Unix epoch. Returns `None` when out of range.
    pub fn from_millis(millis: i64) -> Option<Date> {
        Utc.timestamp_millis_opt(millis).single().map(Date)
    }

    pub fn now() -> Date {
        Date(Utc::now())
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl From<DateTime<Utc>> for Date {
    fn from(value: DateTime<Utc>) -> Self {
        Date(value)
    }
}

impl From<SystemTime> for Date {
    fn from(value: SystemTime) -> Self {
        Date(DateTime::<Utc>::from(value))
    }
}

impl Serialize for Date {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        date::serialize(&self.0, serializer)
    }
}

/// `#[serde(with = "jsbridge::date")]` for `DateTime<Utc>` fields.
///
/// Other serializers see the timestamp as a number of milliseconds.
pub mod date {
    use super::DATE_TOKEN;
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(DATE_TOKEN, &(value.timestamp_millis() as f64))
    }
}

/// Bytes that marshal into a VM `ArrayBuffer` instead of an array of numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RawBuffer(pub Vec<u8>);

impl From<Vec<u8>> for RawBuffer {
    fn from(value: Vec<u8>) -> Self {
        RawBuffer(value)
    }
}

impl Serialize for RawBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

/// `#[serde(with = "jsbridge::raw_buffer")]` for byte fields that should
/// become an `ArrayBuffer`.
pub mod raw_buffer {
    use serde::Serializer;

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]> + ?Sized,
    {
        serializer.serialize_bytes(value.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_millis() {
        let date = Date::from_millis(1_525_767_406_918).unwrap();
        assert_eq!(date.millis(), 1_525_767_406_918);
        assert_eq!(date.0.to_rfc3339(), "2018-05-08T08:16:46.918+00:00");
    }

    #[test]
    fn test_date_from_system_time() {
        let time = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1500);
        assert_eq!(Date::from(time).millis(), 1500);
    }

    #[test]
    fn test_foreign_serializers_see_plain_data() {
        let date = Date::from_millis(42).unwrap();
        assert_eq!(serde_json::to_string(&date).unwrap(), "42.0");
        assert_eq!(
            serde_json::to_string(&RawBuffer(vec![1, 2])).unwrap(),
            "[1,2]"
        );
    }
}
