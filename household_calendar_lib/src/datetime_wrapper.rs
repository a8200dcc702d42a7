//! RFC 3339 (de)serialization for backend timestamps.
//!
//! The backend emits `+00:00` offsets; some clients send `Z`. Both are
//! accepted and values are normalised to UTC.

use anyhow::Error;
use derive_more::{Deref, From, Into};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as DeError, ser};
use stack_string::StackString;
use std::fmt;
use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};

#[derive(Debug, Clone, Copy, Deref, Into, From, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTimeType(OffsetDateTime);

impl fmt::Display for DateTimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        if let Ok(s) = convert_datetime_to_str(self.0) {
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

impl Serialize for DateTimeType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for DateTimeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(Self)
    }
}

/// # Errors
/// Returns error if formatting fails
pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&convert_datetime_to_str(*datetime).map_err(ser::Error::custom)?)
}

/// # Errors
/// Returns error if the value is not an RFC 3339 string
pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = StackString::deserialize(deserializer)?;
    convert_str_to_datetime(&s).map_err(DeError::custom)
}

pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    use super::DateTimeType;

    /// # Errors
    /// Returns error if formatting fails
    pub fn serialize<S>(datetime: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match datetime {
            Some(dt) => super::serialize(dt, serializer),
            None => serializer.serialize_none(),
        }
    }

    /// # Errors
    /// Returns error if a present value is not an RFC 3339 string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<DateTimeType>::deserialize(deserializer).map(|dt| dt.map(Into::into))
    }
}

/// # Errors
/// Returns error if formatting fails
pub fn convert_datetime_to_str(datetime: OffsetDateTime) -> Result<StackString, Error> {
    datetime
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(Into::into)
        .map(|s| s.replace('Z', "+00:00"))
        .map(Into::into)
}

/// # Errors
/// Return error if the string is not RFC 3339
pub fn convert_str_to_datetime(s: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(&s.replace('Z', "+00:00"), &Rfc3339)
        .map(|x| x.to_offset(UtcOffset::UTC))
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use time::macros::datetime;

    use crate::datetime_wrapper::{DateTimeType, convert_datetime_to_str, convert_str_to_datetime};

    #[test]
    fn test_backend_timestamp_formats() -> Result<(), Error> {
        let expected = datetime!(2026-10-15 13:00:00 UTC);
        assert_eq!(convert_str_to_datetime("2026-10-15T13:00:00Z")?, expected);
        assert_eq!(
            convert_str_to_datetime("2026-10-15T09:00:00-04:00")?,
            expected
        );
        assert_eq!(
            convert_datetime_to_str(expected)?.as_str(),
            "2026-10-15T13:00:00+00:00"
        );
        let dt: DateTimeType = serde_json::from_str(r#""2026-10-15T13:00:00.123456+00:00""#)?;
        assert!(*dt > expected);
        Ok(())
    }
}
