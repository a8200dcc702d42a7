use anyhow::{Error, format_err};
use derive_more::Into;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt, ops::Deref, str::FromStr};
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, macros::time};
use time_tz::{
    OffsetDateTimeExt, PrimitiveDateTimeExt, TimeZone as TzTimeZone, Tz,
    timezones::{db::UTC, get_by_name},
};

use stack_string::StackString;

/// Named time zone used for wall-clock input and all-day boundaries
#[derive(Into, Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[serde(into = "StackString", try_from = "StackString")]
pub struct TimeZone(&'static Tz);

impl TimeZone {
    #[must_use]
    pub fn utc() -> Self {
        Self(UTC)
    }

    #[must_use]
    pub fn local() -> Self {
        Self(time_tz::system::get_timezone().unwrap_or(UTC))
    }

    #[must_use]
    pub fn to_local(self, dt: OffsetDateTime) -> OffsetDateTime {
        dt.to_timezone(self.0)
    }

    #[must_use]
    pub fn local_date(self, dt: OffsetDateTime) -> Date {
        self.to_local(dt).date()
    }

    /// # Errors
    /// Returns error if the wall-clock time does not exist in this zone
    pub fn from_local(self, dt: PrimitiveDateTime) -> Result<OffsetDateTime, Error> {
        dt.assume_timezone(self.0)
            .take_first()
            .ok_or_else(|| format_err!("{dt} does not exist in {self}"))
    }

    /// # Errors
    /// Returns error if local midnight does not exist in this zone
    pub fn start_of_day(self, date: Date) -> Result<OffsetDateTime, Error> {
        self.from_local(PrimitiveDateTime::new(date, Time::MIDNIGHT))
    }

    /// # Errors
    /// Returns error if 23:59:59 does not exist in this zone
    pub fn end_of_day(self, date: Date) -> Result<OffsetDateTime, Error> {
        self.from_local(PrimitiveDateTime::new(date, time!(23:59:59)))
    }
}

impl Deref for TimeZone {
    type Target = Tz;
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl fmt::Display for TimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

impl From<TimeZone> for StackString {
    fn from(item: TimeZone) -> Self {
        item.0.name().into()
    }
}

impl FromStr for TimeZone {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        get_by_name(s)
            .map(Self)
            .ok_or_else(|| format_err!("{s} is not a valid timezone"))
    }
}

impl TryFrom<StackString> for TimeZone {
    type Error = Error;
    fn try_from(item: StackString) -> Result<Self, Self::Error> {
        item.as_str().parse()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use time::macros::{date, datetime};

    use crate::timezone::TimeZone;

    #[test]
    fn test_parse_timezone() -> Result<(), Error> {
        let tz: TimeZone = "America/New_York".parse()?;
        assert_eq!(tz.to_string(), "America/New_York");
        assert!("Not/AZone".parse::<TimeZone>().is_err());
        Ok(())
    }

    #[test]
    fn test_day_boundaries() -> Result<(), Error> {
        let tz: TimeZone = "America/New_York".parse()?;
        let start = tz.start_of_day(date!(2026 - 07 - 04))?;
        let end = tz.end_of_day(date!(2026 - 07 - 04))?;
        assert_eq!(start, datetime!(2026-07-04 04:00:00 UTC));
        assert_eq!(end, datetime!(2026-07-05 03:59:59 UTC));
        assert_eq!(tz.local_date(end), date!(2026 - 07 - 04));
        Ok(())
    }
}
