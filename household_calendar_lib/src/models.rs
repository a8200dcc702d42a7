use serde::{Deserialize, Serialize};
use stack_string::{StackString, format_sstr};
use std::fmt;
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime,
    format_description::well_known::Rfc3339,
    macros::format_description,
};

use crate::{
    datetime_wrapper, errors::CalendarError, reminder_scheduler::ReminderOffset,
    timezone::TimeZone,
};

pub const DEFAULT_COLOR: &str = "#3b82f6";

pub const PALETTE: [(&str, &str); 6] = [
    ("Blue", "#3b82f6"),
    ("Green", "#10b981"),
    ("Yellow", "#f59e0b"),
    ("Red", "#ef4444"),
    ("Purple", "#8b5cf6"),
    ("Pink", "#ec4899"),
];

#[must_use]
pub fn color_name(color: &str) -> Option<&'static str> {
    PALETTE
        .iter()
        .find(|(_, value)| value.eq_ignore_ascii_case(color))
        .map(|(name, _)| *name)
}

fn default_color() -> StackString {
    DEFAULT_COLOR.into()
}

fn default_true() -> bool {
    true
}

/// A row of the `events` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: StackString,
    pub title: StackString,
    #[serde(default)]
    pub description: Option<StackString>,
    #[serde(with = "datetime_wrapper")]
    pub start_time: OffsetDateTime,
    #[serde(with = "datetime_wrapper")]
    pub end_time: OffsetDateTime,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default = "default_color")]
    pub color: StackString,
    pub created_by: StackString,
    #[serde(default = "default_true")]
    pub reminder_15min: bool,
    #[serde(default)]
    pub reminder_1hr: bool,
    #[serde(default)]
    pub reminder_1day: bool,
    #[serde(default, with = "datetime_wrapper::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "datetime_wrapper::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Event {
    /// Offsets whose reminder flag is set, longest lead time first.
    pub fn reminder_offsets(&self) -> impl Iterator<Item = ReminderOffset> + '_ {
        ReminderOffset::ALL
            .into_iter()
            .filter(move |offset| match offset {
                ReminderOffset::OneDay => self.reminder_1day,
                ReminderOffset::OneHour => self.reminder_1hr,
                ReminderOffset::FifteenMinutes => self.reminder_15min,
            })
    }

    #[must_use]
    pub fn summary(&self, tz: TimeZone) -> StackString {
        let start = tz.to_local(self.start_time);
        let when = if self.all_day {
            start
                .format(format_description!("[year]-[month]-[day]"))
                .map(|d| format_sstr!("{d} (all day)"))
        } else {
            start
                .format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
                .map(Into::into)
        };
        let when = when.unwrap_or_else(|_| StackString::from_display(start));
        format_sstr!("{when} {} [{}]", self.title, self.id)
    }

    /// Build the row the backend would hold for a validated insert.
    #[must_use]
    pub fn from_insert(id: impl Into<StackString>, insert: EventInsert) -> Self {
        let EventInsert { created_by, patch } = insert;
        Self {
            id: id.into(),
            created_by,
            created_at: None,
            updated_at: None,
            ..Self::default_from_patch(patch)
        }
    }

    pub fn apply_patch(&mut self, patch: EventPatch) {
        let created_by = self.created_by.clone();
        let id = self.id.clone();
        let created_at = self.created_at;
        *self = Self {
            id,
            created_by,
            created_at,
            updated_at: self.updated_at,
            ..Self::default_from_patch(patch)
        };
    }

    fn default_from_patch(patch: EventPatch) -> Self {
        Self {
            id: StackString::new(),
            title: patch.title,
            description: patch.description,
            start_time: patch.start_time,
            end_time: patch.end_time,
            all_day: patch.all_day,
            color: patch.color,
            created_by: StackString::new(),
            reminder_15min: patch.reminder_15min,
            reminder_1hr: patch.reminder_1hr,
            reminder_1day: patch.reminder_1day,
            created_at: None,
            updated_at: None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary(TimeZone::utc()))
    }
}

/// Event fields as entered by a user, before validation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub title: StackString,
    #[serde(default)]
    pub description: Option<StackString>,
    pub start_time: StackString,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub color: Option<StackString>,
    #[serde(default = "default_true")]
    pub reminder_15min: bool,
    #[serde(default)]
    pub reminder_1hr: bool,
    #[serde(default)]
    pub reminder_1day: bool,
}

impl Default for EventData {
    fn default() -> Self {
        Self {
            title: StackString::new(),
            description: None,
            start_time: StackString::new(),
            all_day: false,
            color: None,
            reminder_15min: true,
            reminder_1hr: false,
            reminder_1day: false,
        }
    }
}

impl EventData {
    /// Check required fields and derive `end_time`.
    ///
    /// # Errors
    /// Returns `ValidationError` naming the offending field
    pub fn validate(&self, tz: TimeZone) -> Result<EventPatch, CalendarError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(CalendarError::validation("title", "must not be empty"));
        }
        let start_time = parse_start_time(&self.start_time, self.all_day, tz)?;
        let end_time = derive_end_time(start_time, self.all_day, tz)?;
        let description = self
            .description
            .as_ref()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(Into::into);
        let color = self
            .color
            .as_ref()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map_or_else(default_color, Into::into);
        Ok(EventPatch {
            title: title.into(),
            description,
            start_time,
            end_time,
            all_day: self.all_day,
            color,
            reminder_15min: self.reminder_15min,
            reminder_1hr: self.reminder_1hr,
            reminder_1day: self.reminder_1day,
        })
    }
}

/// Validated column values sent on insert and update.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventPatch {
    pub title: StackString,
    pub description: Option<StackString>,
    #[serde(with = "datetime_wrapper")]
    pub start_time: OffsetDateTime,
    #[serde(with = "datetime_wrapper")]
    pub end_time: OffsetDateTime,
    pub all_day: bool,
    pub color: StackString,
    pub reminder_15min: bool,
    pub reminder_1hr: bool,
    pub reminder_1day: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventInsert {
    pub created_by: StackString,
    #[serde(flatten)]
    pub patch: EventPatch,
}

/// Parse user supplied start time.
///
/// Accepts RFC 3339, a local `YYYY-MM-DDTHH:MM[:SS]` and, for all-day events,
/// a bare `YYYY-MM-DD`. All-day events start at local midnight.
///
/// # Errors
/// Returns `ValidationError` for `start_time` if nothing matches
pub fn parse_start_time(
    s: &str,
    all_day: bool,
    tz: TimeZone,
) -> Result<OffsetDateTime, CalendarError> {
    let s = s.trim();
    let invalid = |msg: &str| CalendarError::validation("start_time", format_sstr!("{msg}: {s:?}"));
    if s.is_empty() {
        return Err(CalendarError::validation("start_time", "must not be empty"));
    }
    let local_midnight = |date: Date| {
        tz.start_of_day(date)
            .map_err(|e| CalendarError::validation("start_time", format_sstr!("{e}")))
    };
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
        return if all_day {
            local_midnight(tz.local_date(dt))
        } else {
            Ok(dt)
        };
    }
    let naive = PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(s, format_description!("[year]-[month]-[day]T[hour]:[minute]"))
    });
    if let Ok(naive) = naive {
        return if all_day {
            local_midnight(naive.date())
        } else {
            tz.from_local(naive)
                .map_err(|e| CalendarError::validation("start_time", format_sstr!("{e}")))
        };
    }
    match Date::parse(s, format_description!("[year]-[month]-[day]")) {
        Ok(date) if all_day => local_midnight(date),
        Ok(_) => Err(invalid("time of day required for timed event")),
        Err(_) => Err(invalid("not a valid date/time")),
    }
}

/// End of the local day for all-day events, one hour after start otherwise.
///
/// # Errors
/// Returns `ValidationError` if the end of day does not exist in `tz`
pub fn derive_end_time(
    start_time: OffsetDateTime,
    all_day: bool,
    tz: TimeZone,
) -> Result<OffsetDateTime, CalendarError> {
    if all_day {
        tz.end_of_day(tz.local_date(start_time))
            .map_err(|e| CalendarError::validation("start_time", format_sstr!("{e}")))
    } else {
        Ok(start_time + Duration::hours(1))
    }
}

/// A row of the `profiles` table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: StackString,
    #[serde(default)]
    pub email: Option<StackString>,
    #[serde(default)]
    pub name: Option<StackString>,
    #[serde(default)]
    pub avatar_url: Option<StackString>,
    #[serde(default, with = "datetime_wrapper::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "datetime_wrapper::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Profile {
    /// Name shown to other household members.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_ref()
            .or(self.email.as_ref())
            .map(StackString::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Someone")
    }

    /// Name used when announcing this member's events to others.
    #[must_use]
    pub fn name_or_someone(&self) -> &str {
        self.name
            .as_ref()
            .map(StackString::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Someone")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub id: StackString,
    pub email: StackString,
    pub name: Option<StackString>,
    pub avatar_url: Option<StackString>,
    #[serde(with = "datetime_wrapper")]
    pub updated_at: OffsetDateTime,
}

impl From<ProfileUpdate> for Profile {
    fn from(item: ProfileUpdate) -> Self {
        Self {
            id: item.id,
            email: Some(item.email),
            name: item.name,
            avatar_url: item.avatar_url,
            created_at: None,
            updated_at: Some(item.updated_at),
        }
    }
}
