use itertools::Itertools;
use log::debug;
use stack_string::{StackString, format_sstr};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};
use time::{Duration, OffsetDateTime};

use crate::{
    models::Event,
    notification::{Notification, NotificationSink},
};

/// How late a due reminder may still be shown; anything older is dropped.
pub const MISSED_REMINDER_GRACE: Duration = Duration::minutes(1);

/// Lead time of a reminder before the event starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReminderOffset {
    FifteenMinutes,
    OneHour,
    OneDay,
}

impl ReminderOffset {
    pub const ALL: [Self; 3] = [Self::OneDay, Self::OneHour, Self::FifteenMinutes];

    #[must_use]
    pub fn minutes(self) -> i64 {
        match self {
            Self::FifteenMinutes => 15,
            Self::OneHour => 60,
            Self::OneDay => 24 * 60,
        }
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        Duration::minutes(self.minutes())
    }

    #[must_use]
    pub fn phrase(self) -> &'static str {
        match self {
            Self::FifteenMinutes => "In 15 minutes",
            Self::OneHour => "In 1 hour",
            Self::OneDay => "Tomorrow",
        }
    }

    #[must_use]
    pub fn from_minutes(minutes: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.minutes() == minutes)
    }
}

impl fmt::Display for ReminderOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReminderKey {
    pub event_id: StackString,
    pub offset: ReminderOffset,
}

impl ReminderKey {
    pub fn new(event_id: impl Into<StackString>, offset: ReminderOffset) -> Self {
        Self {
            event_id: event_id.into(),
            offset,
        }
    }

    /// Tag shared by every firing of the same logical reminder.
    #[must_use]
    pub fn tag(&self) -> StackString {
        format_sstr!("reminder-{}-{}", self.event_id, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledReminder {
    pub key: ReminderKey,
    pub fire_time: OffsetDateTime,
    pub title: StackString,
}

impl ScheduledReminder {
    #[must_use]
    pub fn notification(&self) -> Notification {
        Notification {
            title: format_sstr!("Upcoming Event: {}", self.title),
            body: self.key.offset.phrase().into(),
            tag: self.key.tag(),
            require_interaction: true,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub scheduled: Vec<ReminderKey>,
    pub cancelled: Vec<ReminderKey>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.scheduled.is_empty() && self.cancelled.is_empty()
    }
}

/// Result of one `fire_due` pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FireOutcome {
    pub fired: Vec<ScheduledReminder>,
    pub missed: Vec<ScheduledReminder>,
}

/// Pending one-shot reminders keyed by (event id, offset).
///
/// `timeline` orders the same entries by fire time so the driving loop only
/// ever has to look at the head.
#[derive(Debug, Default)]
pub struct ReminderScheduler {
    entries: HashMap<ReminderKey, ScheduledReminder>,
    timeline: BTreeSet<(OffsetDateTime, ReminderKey)>,
}

impl ReminderScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &ReminderKey) -> Option<&ScheduledReminder> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduledReminder> {
        self.timeline
            .iter()
            .filter_map(|(_, key)| self.entries.get(key))
    }

    #[must_use]
    pub fn next_fire_time(&self) -> Option<OffsetDateTime> {
        self.timeline.first().map(|(fire_time, _)| *fire_time)
    }

    /// Keys whose fire time is at or before `now`, earliest first.
    #[must_use]
    pub fn due(&self, now: OffsetDateTime) -> Vec<ReminderKey> {
        self.timeline
            .iter()
            .take_while(|(fire_time, _)| *fire_time <= now)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Remove entries that became due more than `MISSED_REMINDER_GRACE`
    /// before `now`. Nothing is shown for them.
    pub fn expire(&mut self, now: OffsetDateTime) -> Vec<ScheduledReminder> {
        let floor = now - MISSED_REMINDER_GRACE;
        let keys: Vec<ReminderKey> = self
            .timeline
            .iter()
            .take_while(|(fire_time, _)| *fire_time < floor)
            .map(|(_, key)| key.clone())
            .collect();
        let expired: Vec<_> = keys.iter().filter_map(|key| self.remove(key)).collect();
        for reminder in &expired {
            debug!("dropping missed {} due {}", reminder.key.tag(), reminder.fire_time);
        }
        expired
    }

    /// Bring the pending set in line with `events`.
    ///
    /// A new entry is scheduled when its flag is set and `start_time - offset > now`.
    /// Identical entries are left in place, including ones that became due
    /// within `MISSED_REMINDER_GRACE` and haven't fired yet; an entry whose
    /// fire time or title changed is cancelled and scheduled again.
    pub fn reconcile<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
        now: OffsetDateTime,
    ) -> ReconcileOutcome {
        let floor = now - MISSED_REMINDER_GRACE;
        let desired: HashMap<ReminderKey, ScheduledReminder> = events
            .into_iter()
            .flat_map(|event| {
                event.reminder_offsets().filter_map(move |offset| {
                    let fire_time = event.start_time - offset.duration();
                    if fire_time >= floor {
                        let key = ReminderKey::new(event.id.clone(), offset);
                        let reminder = ScheduledReminder {
                            key: key.clone(),
                            fire_time,
                            title: event.title.clone(),
                        };
                        Some((key, reminder))
                    } else {
                        None
                    }
                })
            })
            .collect();

        let stale: Vec<ReminderKey> = self
            .entries
            .iter()
            .filter(|(key, current)| desired.get(*key) != Some(*current))
            .map(|(key, _)| key.clone())
            .sorted()
            .collect();
        for key in &stale {
            self.remove(key);
        }

        let mut outcome = ReconcileOutcome {
            cancelled: stale,
            scheduled: Vec::new(),
        };
        for (key, reminder) in desired.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            if self.entries.contains_key(&key) || reminder.fire_time <= now {
                continue;
            }
            self.insert(reminder);
            outcome.scheduled.push(key);
        }
        if !outcome.is_noop() {
            debug!(
                "reconcile scheduled {} cancelled {} pending {}",
                outcome.scheduled.len(),
                outcome.cancelled.len(),
                self.len()
            );
        }
        outcome
    }

    /// Cancel every pending reminder of `event_id`.
    pub fn cancel_for_event(&mut self, event_id: &str) -> Vec<ScheduledReminder> {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|key| key.event_id.as_str() == event_id)
            .cloned()
            .sorted()
            .collect();
        let cancelled: Vec<_> = keys.iter().filter_map(|key| self.remove(key)).collect();
        if !cancelled.is_empty() {
            debug!("cancelled {} reminders for {event_id}", cancelled.len());
        }
        cancelled
    }

    /// Deliver a pending reminder and drop it.
    ///
    /// Returns `None` without emitting anything when the entry already fired
    /// or was cancelled.
    pub fn fire<N>(&mut self, key: &ReminderKey, sink: &mut N) -> Option<ScheduledReminder>
    where
        N: NotificationSink + ?Sized,
    {
        let reminder = self.remove(key)?;
        debug!("firing {}", key.tag());
        sink.show(&reminder.notification());
        Some(reminder)
    }

    fn insert(&mut self, reminder: ScheduledReminder) {
        self.remove(&reminder.key);
        self.timeline
            .insert((reminder.fire_time, reminder.key.clone()));
        self.entries.insert(reminder.key.clone(), reminder);
    }

    fn remove(&mut self, key: &ReminderKey) -> Option<ScheduledReminder> {
        let reminder = self.entries.remove(key)?;
        self.timeline
            .remove(&(reminder.fire_time, reminder.key.clone()));
        Some(reminder)
    }
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime, macros::datetime};

    use crate::{
        models::{DEFAULT_COLOR, Event},
        notification::RecordingSink,
        reminder_scheduler::{
            MISSED_REMINDER_GRACE, ReminderKey, ReminderOffset, ReminderScheduler,
        },
    };

    fn event(id: &str, start_time: OffsetDateTime, flags: (bool, bool, bool)) -> Event {
        Event {
            id: id.into(),
            title: "Dentist".into(),
            description: None,
            start_time,
            end_time: start_time + Duration::hours(1),
            all_day: false,
            color: DEFAULT_COLOR.into(),
            created_by: "u1".into(),
            reminder_15min: flags.0,
            reminder_1hr: flags.1,
            reminder_1day: flags.2,
            created_at: None,
            updated_at: None,
        }
    }

    const NOW: OffsetDateTime = datetime!(2026-10-15 12:00:00 UTC);

    #[test]
    fn test_offsets() {
        assert_eq!(ReminderOffset::from_minutes(1440), Some(ReminderOffset::OneDay));
        assert_eq!(ReminderOffset::from_minutes(30), None);
        assert_eq!(ReminderOffset::OneHour.phrase(), "In 1 hour");
        assert_eq!(
            ReminderKey::new("e1", ReminderOffset::FifteenMinutes)
                .tag()
                .as_str(),
            "reminder-e1-15"
        );
    }

    #[test]
    fn test_all_flags_two_days_out() {
        let events = [event("e1", NOW + Duration::days(2), (true, true, true))];
        let mut scheduler = ReminderScheduler::new();
        let outcome = scheduler.reconcile(&events, NOW);
        assert_eq!(outcome.scheduled.len(), 3);
        assert!(outcome.cancelled.is_empty());
        let mut minutes: Vec<_> = scheduler.entries().map(|r| r.key.offset.minutes()).collect();
        minutes.sort_unstable();
        assert_eq!(minutes, vec![15, 60, 1440]);
        assert_eq!(
            scheduler.next_fire_time(),
            Some(NOW + Duration::days(1))
        );
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let events = [
            event("e1", NOW + Duration::days(2), (true, true, true)),
            event("e2", NOW + Duration::hours(3), (true, false, false)),
        ];
        let mut scheduler = ReminderScheduler::new();
        assert!(!scheduler.reconcile(&events, NOW).is_noop());
        let second = scheduler.reconcile(&events, NOW);
        assert!(second.is_noop());
        assert_eq!(scheduler.len(), 4);
    }

    #[test]
    fn test_thresholds_exclude_elapsed_fire_times() {
        let events = [
            event("soon", NOW + Duration::minutes(10), (true, true, true)),
            event("later", NOW + Duration::minutes(45), (true, true, true)),
            event("exact", NOW + Duration::minutes(15), (true, false, false)),
        ];
        let mut scheduler = ReminderScheduler::new();
        scheduler.reconcile(&events, NOW);
        assert!(
            scheduler
                .entries()
                .all(|r| r.key.event_id.as_str() == "later")
        );
        assert_eq!(scheduler.len(), 1);
        assert!(
            scheduler
                .get(&ReminderKey::new("later", ReminderOffset::FifteenMinutes))
                .is_some()
        );
    }

    #[test]
    fn test_removed_event_is_cancelled() {
        let mut events = vec![
            event("e1", NOW + Duration::days(2), (true, true, false)),
            event("e2", NOW + Duration::days(2), (true, false, false)),
        ];
        let mut scheduler = ReminderScheduler::new();
        scheduler.reconcile(&events, NOW);
        events.retain(|e| e.id.as_str() != "e1");
        let outcome = scheduler.reconcile(&events, NOW);
        assert_eq!(outcome.cancelled.len(), 2);
        assert!(scheduler.entries().all(|r| r.key.event_id.as_str() == "e2"));
    }

    #[test]
    fn test_moved_start_time_replaces_entry() {
        let mut events = vec![event("e1", NOW + Duration::hours(5), (false, true, false))];
        let mut scheduler = ReminderScheduler::new();
        scheduler.reconcile(&events, NOW);
        events[0].start_time = NOW + Duration::hours(8);
        let outcome = scheduler.reconcile(&events, NOW);
        let key = ReminderKey::new("e1", ReminderOffset::OneHour);
        assert_eq!(outcome.cancelled, vec![key.clone()]);
        assert_eq!(outcome.scheduled, vec![key.clone()]);
        assert_eq!(
            scheduler.get(&key).map(|r| r.fire_time),
            Some(NOW + Duration::hours(7))
        );
        assert!(scheduler.due(NOW + Duration::hours(4)).is_empty());
    }

    #[test]
    fn test_fire_is_one_shot() {
        let events = [event("e1", NOW + Duration::minutes(90), (true, true, false))];
        let mut scheduler = ReminderScheduler::new();
        let mut sink = RecordingSink::granted();
        scheduler.reconcile(&events, NOW);
        assert_eq!(scheduler.len(), 2);

        let due = scheduler.due(NOW + Duration::minutes(30));
        let key = ReminderKey::new("e1", ReminderOffset::OneHour);
        assert_eq!(due, vec![key.clone()]);
        assert!(scheduler.fire(&key, &mut sink).is_some());
        assert!(scheduler.fire(&key, &mut sink).is_none());
        assert_eq!(sink.shown.len(), 1);
        assert_eq!(sink.shown[0].body.as_str(), "In 1 hour");
        assert_eq!(sink.shown[0].tag.as_str(), "reminder-e1-60");
        assert_eq!(sink.shown[0].title.as_str(), "Upcoming Event: Dentist");

        assert_eq!(scheduler.cancel_for_event("e1").len(), 1);
        let key = ReminderKey::new("e1", ReminderOffset::FifteenMinutes);
        assert!(scheduler.fire(&key, &mut sink).is_none());
        assert_eq!(sink.shown.len(), 1);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_fire_time(), None);
    }

    #[test]
    fn test_late_reminders_are_dropped() {
        let events = [event("e1", NOW + Duration::minutes(20), (true, true, false))];
        let mut scheduler = ReminderScheduler::new();
        scheduler.reconcile(&events, NOW);
        assert_eq!(scheduler.len(), 1);

        let late = NOW + Duration::minutes(5) + MISSED_REMINDER_GRACE;
        assert!(scheduler.expire(late).is_empty());
        let outcome = scheduler.reconcile(&events, late);
        assert!(outcome.is_noop());
        assert_eq!(scheduler.due(late).len(), 1);

        let expired = scheduler.expire(NOW + Duration::hours(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, ReminderKey::new("e1", ReminderOffset::FifteenMinutes));
        assert!(scheduler.is_empty());
        assert!(scheduler.reconcile(&events, NOW + Duration::hours(3)).is_noop());
    }
}
