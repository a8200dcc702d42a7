use log::{debug, error, info};
use stack_string::{StackString, format_sstr};
use std::{collections::HashMap, sync::Arc};
use time::{Date, Duration, OffsetDateTime};

use crate::{
    change_feed::ChangeEvent,
    clock::Clock,
    datastore::DataStore,
    email::EventAnnouncer,
    errors::CalendarError,
    models::{Event, EventData, EventInsert, Profile, ProfileUpdate},
    notification::{Notification, NotificationSink, Permission},
    reminder_scheduler::{FireOutcome, ReconcileOutcome, ReminderScheduler},
    timezone::TimeZone,
};

/// Local view of the household calendar for one signed in user.
///
/// Owns the event list, the profile list and the reminder schedule. Every
/// mutation goes through `&mut self`, so a single task drives it.
pub struct EventViewModel<D, N> {
    store: D,
    sink: N,
    clock: Arc<dyn Clock>,
    tz: TimeZone,
    user_id: StackString,
    events: Vec<Event>,
    profiles: Vec<Profile>,
    scheduler: ReminderScheduler,
    awaiting_echo: HashMap<StackString, OffsetDateTime>,
    announcer: Option<Arc<dyn EventAnnouncer>>,
}

impl<D, N> EventViewModel<D, N>
where
    D: DataStore,
    N: NotificationSink,
{
    pub fn new(
        store: D,
        sink: N,
        clock: Arc<dyn Clock>,
        tz: TimeZone,
        user_id: impl Into<StackString>,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            tz,
            user_id: user_id.into(),
            events: Vec::new(),
            profiles: Vec::new(),
            scheduler: ReminderScheduler::new(),
            awaiting_echo: HashMap::new(),
            announcer: None,
        }
    }

    /// Announce every event created through `create_event`.
    #[must_use]
    pub fn with_announcer(mut self, announcer: Arc<dyn EventAnnouncer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    #[must_use]
    pub fn time_zone(&self) -> TimeZone {
        self.tz
    }

    #[must_use]
    pub fn store(&self) -> &D {
        &self.store
    }

    #[must_use]
    pub fn sink(&self) -> &N {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut N {
        &mut self.sink
    }

    /// Events ordered by start time.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    #[must_use]
    pub fn scheduler(&self) -> &ReminderScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn event(&self, id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.id.as_str() == id)
    }

    /// Events whose start falls on `date` in the local time zone.
    #[must_use]
    pub fn events_on(&self, date: Date) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| self.tz.local_date(e.start_time) == date)
            .collect()
    }

    /// Name of a profile, "Someone" when unknown or unnamed.
    #[must_use]
    pub fn profile_name(&self, id: &str) -> &str {
        self.profiles
            .iter()
            .find(|p| p.id.as_str() == id)
            .map_or("Someone", Profile::name_or_someone)
    }

    /// Ask the sink for permission to show notifications.
    ///
    /// Reminders are scheduled either way; without permission they fire silently.
    ///
    /// # Errors
    /// Returns `PermissionDenied` unless permission was granted
    pub fn enable_notifications(&mut self) -> Result<(), CalendarError> {
        match self.sink.request_permission() {
            Permission::Granted => Ok(()),
            permission => {
                info!("notification permission {permission}");
                Err(CalendarError::PermissionDenied)
            }
        }
    }

    /// Replace local state with the backend's current events and profiles.
    ///
    /// # Errors
    /// Returns `FetchError` if either collection can't be read; local state is
    /// left untouched in that case
    pub async fn load(&mut self) -> Result<(&[Event], &[Profile]), CalendarError> {
        let (mut events, profiles) =
            futures::try_join!(self.store.fetch_events(), self.store.fetch_profiles())
                .map_err(CalendarError::FetchError)?;
        events.sort_by_key(|e| e.start_time);
        self.awaiting_echo
            .retain(|id, _| !events.iter().any(|e| e.id == *id));
        self.events = events;
        self.profiles = profiles;
        self.reconcile();
        debug!(
            "loaded {} events {} profiles",
            self.events.len(),
            self.profiles.len()
        );
        Ok((self.events.as_slice(), self.profiles.as_slice()))
    }

    /// Apply one change feed message.
    pub fn apply_change(&mut self, change: ChangeEvent) -> ReconcileOutcome {
        debug!("change {} {}", change.kind(), change.event_id());
        match change {
            ChangeEvent::Inserted(event) => {
                self.awaiting_echo.remove(&event.id);
                if self.event(&event.id).is_some() {
                    debug!("ignoring duplicate insert {}", event.id);
                } else {
                    if event.created_by != self.user_id {
                        let notification = Notification {
                            title: "New Event Added".into(),
                            body: format_sstr!(
                                "{} added \"{}\"",
                                self.profile_name(&event.created_by),
                                event.title
                            ),
                            tag: format_sstr!("event-{}", event.id),
                            require_interaction: false,
                        };
                        self.sink.show(&notification);
                    }
                    self.insert_sorted(event);
                }
            }
            ChangeEvent::Updated(event) => {
                self.scheduler.cancel_for_event(&event.id);
                self.remove_event(&event.id);
                self.insert_sorted(event);
            }
            ChangeEvent::Deleted { id } => {
                self.scheduler.cancel_for_event(&id);
                self.remove_event(&id);
            }
        }
        self.reconcile()
    }

    /// Validate and persist a new event owned by the session user.
    ///
    /// The local list is not touched; the row appears once the backend echoes
    /// the insert. Until then its id is reported by `awaiting_echo`. A failed
    /// announcement is logged and doesn't fail the create.
    ///
    /// # Errors
    /// Returns `ValidationError` or `PersistenceError`
    pub async fn create_event(&mut self, data: &EventData) -> Result<Event, CalendarError> {
        let patch = data.validate(self.tz)?;
        let insert = EventInsert {
            created_by: self.user_id.clone(),
            patch,
        };
        let event = self
            .store
            .insert_event(&insert)
            .await
            .map_err(CalendarError::PersistenceError)?;
        if self.event(&event.id).is_none() {
            self.awaiting_echo.insert(event.id.clone(), self.clock.now());
        }
        info!("created event {}", event.id);
        if let Some(announcer) = &self.announcer {
            if let Err(e) = announcer.announce_event(&event.id).await {
                error!("failed to announce event {}: {e}", event.id);
            }
        }
        Ok(event)
    }

    /// # Errors
    /// Returns `ValidationError` or `PersistenceError`
    pub async fn update_event(&mut self, id: &str, data: &EventData) -> Result<(), CalendarError> {
        let patch = data.validate(self.tz)?;
        self.store
            .update_event(id, &patch)
            .await
            .map_err(CalendarError::PersistenceError)?;
        info!("updated event {id}");
        Ok(())
    }

    /// # Errors
    /// Returns `PersistenceError`
    pub async fn delete_event(&mut self, id: &str) -> Result<(), CalendarError> {
        self.store
            .delete_event(id)
            .await
            .map_err(CalendarError::PersistenceError)?;
        info!("deleted event {id}");
        Ok(())
    }

    /// Upsert the session user's own profile.
    ///
    /// # Errors
    /// Returns `ValidationError` for an empty email or `PersistenceError`
    pub async fn update_profile(
        &mut self,
        email: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<&Profile, CalendarError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(CalendarError::validation("email", "must not be empty"));
        }
        let non_empty = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(StackString::from)
        };
        let update = ProfileUpdate {
            id: self.user_id.clone(),
            email: email.into(),
            name: non_empty(name),
            avatar_url: non_empty(avatar_url),
            updated_at: self.clock.now(),
        };
        self.store
            .upsert_profile(&update)
            .await
            .map_err(CalendarError::PersistenceError)?;
        let idx = match self.profiles.iter().position(|p| p.id == update.id) {
            Some(idx) => {
                let profile = &mut self.profiles[idx];
                profile.email = Some(update.email);
                profile.name = update.name;
                profile.avatar_url = update.avatar_url;
                profile.updated_at = Some(update.updated_at);
                idx
            }
            None => {
                self.profiles.push(update.into());
                self.profiles.len() - 1
            }
        };
        Ok(&self.profiles[idx])
    }

    /// Ids returned by `create_event` whose insert echo hasn't arrived yet.
    #[must_use]
    pub fn awaiting_echo(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.awaiting_echo.keys().map(StackString::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Creates still unconfirmed after `window`.
    #[must_use]
    pub fn pending_creates_since(&self, window: Duration) -> Vec<&str> {
        let cutoff = self.clock.now() - window;
        let mut ids: Vec<&str> = self
            .awaiting_echo
            .iter()
            .filter(|(_, created)| **created <= cutoff)
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn next_fire_time(&self) -> Option<OffsetDateTime> {
        self.scheduler.next_fire_time()
    }

    /// Fire every reminder whose time has come.
    ///
    /// Reminders that came due more than `MISSED_REMINDER_GRACE` ago (device
    /// asleep, clock jump) are dropped without being shown and reported as
    /// `missed`.
    pub fn fire_due(&mut self) -> FireOutcome {
        let now = self.clock.now();
        let missed = self.scheduler.expire(now);
        if !missed.is_empty() {
            info!("dropped {} missed reminders", missed.len());
        }
        let fired = self
            .scheduler
            .due(now)
            .iter()
            .filter_map(|key| self.scheduler.fire(key, &mut self.sink))
            .collect();
        FireOutcome { fired, missed }
    }

    fn reconcile(&mut self) -> ReconcileOutcome {
        let now = self.clock.now();
        self.scheduler.reconcile(&self.events, now)
    }

    fn insert_sorted(&mut self, event: Event) {
        let idx = self
            .events
            .partition_point(|e| e.start_time <= event.start_time);
        self.events.insert(idx, event);
    }

    fn remove_event(&mut self, id: &str) -> Option<Event> {
        let idx = self.events.iter().position(|e| e.id.as_str() == id)?;
        Some(self.events.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Error, format_err};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use stack_string::{StackString, format_sstr};
    use std::sync::Arc;
    use time::{
        Duration, OffsetDateTime,
        macros::{date, datetime},
    };

    use crate::{
        change_feed::{ChangeEvent, ChangeFeed},
        clock::ManualClock,
        datastore::{DataStore, MemoryDataStore},
        email::EventAnnouncer,
        errors::CalendarError,
        event_view_model::EventViewModel,
        models::{DEFAULT_COLOR, Event, EventData, Profile},
        notification::{Permission, RecordingSink},
        reminder_scheduler::ReminderOffset,
        timezone::TimeZone,
    };

    const NOW: OffsetDateTime = datetime!(2026-10-15 12:00:00 UTC);

    #[derive(Default)]
    struct RecordingAnnouncer {
        fail: bool,
        announced: Mutex<Vec<StackString>>,
    }

    #[async_trait]
    impl EventAnnouncer for RecordingAnnouncer {
        async fn announce_event(&self, event_id: &str) -> Result<(), CalendarError> {
            self.announced.lock().push(event_id.into());
            if self.fail {
                Err(CalendarError::EmailError(format_err!("provider down")))
            } else {
                Ok(())
            }
        }
    }

    fn profile(id: &str, name: Option<&str>) -> Profile {
        Profile {
            id: id.into(),
            email: Some(format_sstr!("{id}@example.com")),
            name: name.map(Into::into),
            avatar_url: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn event(id: &str, title: &str, created_by: &str, start_time: OffsetDateTime) -> Event {
        Event {
            id: id.into(),
            title: title.into(),
            description: None,
            start_time,
            end_time: start_time + Duration::hours(1),
            all_day: false,
            color: DEFAULT_COLOR.into(),
            created_by: created_by.into(),
            reminder_15min: true,
            reminder_1hr: false,
            reminder_1day: false,
            created_at: None,
            updated_at: None,
        }
    }

    fn view_model(
        store: MemoryDataStore,
        clock: &ManualClock,
    ) -> EventViewModel<MemoryDataStore, RecordingSink> {
        EventViewModel::new(
            store,
            RecordingSink::granted(),
            Arc::new(clock.clone()),
            TimeZone::utc(),
            "u1",
        )
    }

    #[tokio::test]
    async fn test_load_sorts_and_schedules() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            vec![
                event("b", "Dinner", "u2", NOW + Duration::days(2)),
                event("a", "Lunch", "u1", NOW + Duration::days(1)),
            ],
            vec![profile("u1", Some("Alex")), profile("u2", None)],
        );
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);
        let (events, profiles) = vm.load().await?;
        assert_eq!(events.len(), 2);
        assert_eq!(profiles.len(), 2);
        assert_eq!(events[0].id.as_str(), "a");
        assert_eq!(vm.scheduler().len(), 2);
        assert_eq!(vm.events_on(date!(2026 - 10 - 17)).len(), 1);
        assert_eq!(vm.profile_name("u1"), "Alex");
        assert_eq!(vm.profile_name("u2"), "Someone");
        assert_eq!(vm.profile_name("nobody"), "Someone");
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_keeps_state() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            vec![event("a", "Lunch", "u1", NOW + Duration::days(1))],
            Vec::new(),
        );
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store.clone(), &clock);
        vm.load().await?;
        store.fail_next("connection reset");
        assert!(matches!(vm.load().await, Err(CalendarError::FetchError(_))));
        assert_eq!(vm.events().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_insert_notifies_once() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            Vec::new(),
            vec![profile("u1", Some("Alex")), profile("u2", Some("Sam"))],
        );
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);
        vm.load().await?;

        let foreign = event("e1", "Dinner", "u2", NOW + Duration::days(1));
        vm.apply_change(ChangeEvent::Inserted(foreign.clone()));
        vm.apply_change(ChangeEvent::Inserted(foreign));
        assert_eq!(vm.sink().shown.len(), 1);
        let shown = &vm.sink().shown[0];
        assert_eq!(shown.title.as_str(), "New Event Added");
        assert_eq!(shown.body.as_str(), "Sam added \"Dinner\"");
        assert_eq!(shown.tag.as_str(), "event-e1");

        vm.apply_change(ChangeEvent::Inserted(event(
            "e2",
            "Gym",
            "u1",
            NOW + Duration::days(1),
        )));
        assert_eq!(vm.sink().shown.len(), 1);
        assert_eq!(vm.events().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_awaits_echo() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        let mut sub = store.subscribe()?;
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);

        let data = EventData {
            title: "  Dentist ".into(),
            start_time: "2026-10-15T14:00".into(),
            reminder_1hr: true,
            ..EventData::default()
        };
        let created = vm.create_event(&data).await?;
        assert_eq!(created.title.as_str(), "Dentist");
        assert!(vm.events().is_empty());
        assert_eq!(vm.awaiting_echo(), vec![created.id.as_str()]);
        assert!(vm.pending_creates_since(Duration::seconds(30)).is_empty());
        clock.advance(Duration::minutes(1));
        assert_eq!(vm.pending_creates_since(Duration::seconds(30)).len(), 1);

        let echo = sub.try_recv().ok_or_else(|| format_err!("no echo"))?;
        let outcome = vm.apply_change(echo);
        assert_eq!(outcome.scheduled.len(), 2);
        assert!(vm.awaiting_echo().is_empty());
        assert!(vm.sink().shown.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_errors() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store.clone(), &clock);
        let data = EventData {
            title: "".into(),
            start_time: "2026-10-15T14:00".into(),
            ..EventData::default()
        };
        assert!(matches!(
            vm.create_event(&data).await,
            Err(CalendarError::ValidationError { field: "title", .. })
        ));
        let data = EventData {
            title: "Dinner".into(),
            start_time: "2026-10-15T14:00".into(),
            ..EventData::default()
        };
        store.fail_next("permission denied for table events");
        assert!(matches!(
            vm.create_event(&data).await,
            Err(CalendarError::PersistenceError(_))
        ));
        assert!(store.fetch_events().await?.is_empty());
        assert!(vm.awaiting_echo().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_reschedules_and_delete_cancels() -> Result<(), Error> {
        let original = event("e1", "Dinner", "u2", NOW + Duration::hours(5));
        let store = MemoryDataStore::with_data(vec![original.clone()], Vec::new());
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);
        vm.load().await?;
        let fire_time = |vm: &EventViewModel<MemoryDataStore, RecordingSink>| {
            vm.scheduler().entries().next().map(|r| r.fire_time)
        };
        assert_eq!(fire_time(&vm), Some(NOW + Duration::minutes(285)));

        let mut moved = original.clone();
        moved.start_time = NOW + Duration::hours(8);
        moved.end_time = moved.start_time + Duration::hours(1);
        vm.apply_change(ChangeEvent::Updated(moved));
        assert_eq!(fire_time(&vm), Some(NOW + Duration::minutes(465)));
        assert_eq!(vm.scheduler().len(), 1);

        vm.apply_change(ChangeEvent::Deleted { id: "e1".into() });
        assert!(vm.scheduler().is_empty());
        assert!(vm.events().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_permission_schedules_silently() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            vec![event("e1", "Dinner", "u2", NOW + Duration::minutes(20))],
            Vec::new(),
        );
        let clock = ManualClock::new(NOW);
        let mut vm = EventViewModel::new(
            store,
            RecordingSink {
                permission: Permission::Denied,
                shown: Vec::new(),
            },
            Arc::new(clock.clone()),
            TimeZone::utc(),
            "u1",
        );
        assert!(matches!(
            vm.enable_notifications(),
            Err(CalendarError::PermissionDenied)
        ));
        vm.load().await?;
        assert_eq!(vm.scheduler().len(), 1);
        clock.advance(Duration::minutes(5));
        let outcome = vm.fire_due();
        assert_eq!(outcome.fired.len(), 1);
        assert!(outcome.missed.is_empty());
        assert_eq!(outcome.fired[0].key.offset, ReminderOffset::FifteenMinutes);
        assert!(vm.sink().shown.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_reminder_missed_while_asleep_is_dropped() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            vec![
                event("e1", "Dentist", "u2", NOW + Duration::minutes(20)),
                event("e2", "Dinner", "u2", NOW + Duration::hours(6)),
            ],
            Vec::new(),
        );
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);
        vm.load().await?;
        assert_eq!(vm.scheduler().len(), 2);

        clock.advance(Duration::hours(3));
        let outcome = vm.fire_due();
        assert!(outcome.fired.is_empty());
        assert_eq!(outcome.missed.len(), 1);
        assert_eq!(outcome.missed[0].key.event_id.as_str(), "e1");
        assert!(vm.sink().shown.is_empty());
        assert_eq!(vm.scheduler().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_due_reminder_survives_unrelated_change() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(
            vec![event("e1", "Dentist", "u2", NOW + Duration::minutes(20))],
            Vec::new(),
        );
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store, &clock);
        vm.load().await?;

        clock.advance(Duration::minutes(5) + Duration::seconds(30));
        let outcome = vm.apply_change(ChangeEvent::Inserted(event(
            "e2",
            "Gym",
            "u1",
            NOW + Duration::days(2),
        )));
        assert!(outcome.cancelled.is_empty());
        let outcome = vm.fire_due();
        assert_eq!(outcome.fired.len(), 1);
        assert_eq!(vm.sink().shown[0].body.as_str(), "In 15 minutes");
        Ok(())
    }

    #[tokio::test]
    async fn test_update_profile() -> Result<(), Error> {
        let store = MemoryDataStore::with_data(Vec::new(), vec![profile("u1", None)]);
        let clock = ManualClock::new(NOW);
        let mut vm = view_model(store.clone(), &clock);
        vm.load().await?;
        assert!(matches!(
            vm.update_profile("  ", Some("Alex"), None).await,
            Err(CalendarError::ValidationError { field: "email", .. })
        ));
        let profile = vm
            .update_profile("alex@example.com", Some("Alex"), Some(""))
            .await?;
        assert_eq!(profile.display_name(), "Alex");
        assert_eq!(profile.avatar_url, None);
        let stored = store.fetch_profiles().await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name.as_ref().map(StackString::as_str), Some("Alex"));
        assert_eq!(stored[0].updated_at, Some(NOW));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_announces_event() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        let clock = ManualClock::new(NOW);
        let announcer = Arc::new(RecordingAnnouncer::default());
        let mut vm = view_model(store, &clock).with_announcer(announcer.clone());
        let data = EventData {
            title: "Dentist".into(),
            start_time: "2026-10-15T14:00".into(),
            ..EventData::default()
        };
        let created = vm.create_event(&data).await?;
        assert_eq!(*announcer.announced.lock(), vec![created.id.clone()]);

        let invalid = EventData {
            title: "".into(),
            ..data
        };
        assert!(vm.create_event(&invalid).await.is_err());
        assert_eq!(announcer.announced.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_announcement_keeps_create() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        let clock = ManualClock::new(NOW);
        let announcer = Arc::new(RecordingAnnouncer {
            fail: true,
            ..RecordingAnnouncer::default()
        });
        let mut vm = view_model(store.clone(), &clock).with_announcer(announcer.clone());
        let data = EventData {
            title: "Dentist".into(),
            start_time: "2026-10-15T14:00".into(),
            ..EventData::default()
        };
        let created = vm.create_event(&data).await?;
        assert_eq!(announcer.announced.lock().len(), 1);
        assert_eq!(vm.awaiting_echo(), vec![created.id.as_str()]);
        assert!(store.fetch_event(&created.id).await?.is_some());
        Ok(())
    }
}
