use anyhow::{Error, format_err};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, header::HeaderValue};
use serde::de::DeserializeOwned;
use stack_string::{StackString, format_sstr};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use url::Url;
use uuid::Uuid;

use crate::{
    change_feed::{ChangeEvent, ChangeFeed, Subscription},
    config::Config,
    models::{Event, EventInsert, EventPatch, Profile, ProfileUpdate},
};

/// Persistence backend for events and profiles.
///
/// Every call is a single request/response; there is no partial success.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn fetch_events(&self) -> Result<Vec<Event>, Error>;
    async fn fetch_event(&self, id: &str) -> Result<Option<Event>, Error>;
    async fn fetch_profiles(&self) -> Result<Vec<Profile>, Error>;
    async fn insert_event(&self, insert: &EventInsert) -> Result<Event, Error>;
    async fn update_event(&self, id: &str, patch: &EventPatch) -> Result<(), Error>;
    async fn delete_event(&self, id: &str) -> Result<(), Error>;
    async fn upsert_profile(&self, profile: &ProfileUpdate) -> Result<(), Error>;
}

#[async_trait]
impl<T> DataStore for Arc<T>
where
    T: DataStore + ?Sized,
{
    async fn fetch_events(&self) -> Result<Vec<Event>, Error> {
        (**self).fetch_events().await
    }
    async fn fetch_event(&self, id: &str) -> Result<Option<Event>, Error> {
        (**self).fetch_event(id).await
    }
    async fn fetch_profiles(&self) -> Result<Vec<Profile>, Error> {
        (**self).fetch_profiles().await
    }
    async fn insert_event(&self, insert: &EventInsert) -> Result<Event, Error> {
        (**self).insert_event(insert).await
    }
    async fn update_event(&self, id: &str, patch: &EventPatch) -> Result<(), Error> {
        (**self).update_event(id, patch).await
    }
    async fn delete_event(&self, id: &str) -> Result<(), Error> {
        (**self).delete_event(id).await
    }
    async fn upsert_profile(&self, profile: &ProfileUpdate) -> Result<(), Error> {
        (**self).upsert_profile(profile).await
    }
}

/// PostgREST client for the hosted backend.
#[derive(Clone)]
pub struct RestDataStore {
    client: Client,
    rest_url: Url,
    api_key: StackString,
    access_token: Option<StackString>,
}

impl RestDataStore {
    /// # Errors
    /// Returns error if `backend_url` is not a valid url
    pub fn new(config: &Config) -> Result<Self, Error> {
        let base: Url = config.backend_url.parse()?;
        let rest_url = base.join("rest/v1/")?;
        Ok(Self {
            client: Client::new(),
            rest_url,
            api_key: config.backend_key.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, Error> {
        self.rest_url.join(table).map_err(Into::into)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_ref().unwrap_or(&self.api_key);
        req.header("apikey", self.api_key.as_str())
            .bearer_auth(bearer.as_str())
    }

    async fn check(resp: Response) -> Result<Response, Error> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(format_err!("backend returned {status}: {body}"))
        }
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, Error> {
        let url = self.table_url(table)?;
        debug!("GET {url} {query:?}");
        let req = self.authorize(self.client.get(url).query(query));
        let resp = Self::check(req.send().await?).await?;
        resp.json().await.map_err(Into::into)
    }
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn fetch_events(&self) -> Result<Vec<Event>, Error> {
        self.get_rows("events", &[("select", "*"), ("order", "start_time.asc")])
            .await
    }

    async fn fetch_event(&self, id: &str) -> Result<Option<Event>, Error> {
        let filter = format_sstr!("eq.{id}");
        let rows: Vec<Event> = self
            .get_rows("events", &[("select", "*"), ("id", filter.as_str())])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_profiles(&self) -> Result<Vec<Profile>, Error> {
        self.get_rows("profiles", &[("select", "*")]).await
    }

    async fn insert_event(&self, insert: &EventInsert) -> Result<Event, Error> {
        let url = self.table_url("events")?;
        let req = self
            .authorize(self.client.post(url))
            .header("Prefer", HeaderValue::from_static("return=representation"))
            .json(&[insert]);
        let resp = Self::check(req.send().await?).await?;
        let rows: Vec<Event> = resp.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| format_err!("backend returned no row for insert"))
    }

    async fn update_event(&self, id: &str, patch: &EventPatch) -> Result<(), Error> {
        let url = self.table_url("events")?;
        let filter = format_sstr!("eq.{id}");
        let req = self
            .authorize(self.client.patch(url))
            .query(&[("id", filter.as_str())])
            .json(patch);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn delete_event(&self, id: &str) -> Result<(), Error> {
        let url = self.table_url("events")?;
        let filter = format_sstr!("eq.{id}");
        let req = self
            .authorize(self.client.delete(url))
            .query(&[("id", filter.as_str())]);
        Self::check(req.send().await?).await?;
        Ok(())
    }

    async fn upsert_profile(&self, profile: &ProfileUpdate) -> Result<(), Error> {
        let url = self.table_url("profiles")?;
        let req = self
            .authorize(self.client.post(url))
            .header(
                "Prefer",
                HeaderValue::from_static("resolution=merge-duplicates"),
            )
            .json(&[profile]);
        Self::check(req.send().await?).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    events: Vec<Event>,
    profiles: Vec<Profile>,
    subscribers: Vec<UnboundedSender<ChangeEvent>>,
    fail_next: Option<StackString>,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), Error> {
        match self.fail_next.take() {
            Some(msg) => Err(format_err!("{msg}")),
            None => Ok(()),
        }
    }

    fn publish(&mut self, change: &ChangeEvent) {
        self.subscribers
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// In-process backend that echoes every mutation on its change feed.
#[derive(Clone, Default)]
pub struct MemoryDataStore(Arc<Mutex<MemoryState>>);

impl MemoryDataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_data(events: Vec<Event>, profiles: Vec<Profile>) -> Self {
        let store = Self::default();
        {
            let mut state = store.0.lock();
            state.events = events;
            state.profiles = profiles;
        }
        store
    }

    /// Make the next call fail with `msg`.
    pub fn fail_next(&self, msg: &str) {
        self.0.lock().fail_next = Some(msg.into());
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().events.clone()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn fetch_events(&self) -> Result<Vec<Event>, Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.start_time);
        Ok(events)
    }

    async fn fetch_event(&self, id: &str) -> Result<Option<Event>, Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        Ok(state.events.iter().find(|e| e.id.as_str() == id).cloned())
    }

    async fn fetch_profiles(&self) -> Result<Vec<Profile>, Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        Ok(state.profiles.clone())
    }

    async fn insert_event(&self, insert: &EventInsert) -> Result<Event, Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let id = StackString::from_display(Uuid::new_v4());
        let event = Event::from_insert(id, insert.clone());
        state.events.push(event.clone());
        state.publish(&ChangeEvent::Inserted(event.clone()));
        Ok(event)
    }

    async fn update_event(&self, id: &str, patch: &EventPatch) -> Result<(), Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id.as_str() == id)
            .ok_or_else(|| format_err!("No event {id}"))?;
        event.apply_patch(patch.clone());
        let event = event.clone();
        state.publish(&ChangeEvent::Updated(event));
        Ok(())
    }

    async fn delete_event(&self, id: &str) -> Result<(), Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let before = state.events.len();
        state.events.retain(|e| e.id.as_str() != id);
        if state.events.len() < before {
            state.publish(&ChangeEvent::Deleted { id: id.into() });
        }
        Ok(())
    }

    async fn upsert_profile(&self, profile: &ProfileUpdate) -> Result<(), Error> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let update: Profile = profile.clone().into();
        if let Some(existing) = state.profiles.iter_mut().find(|p| p.id == update.id) {
            existing.email = update.email;
            existing.name = update.name;
            existing.avatar_url = update.avatar_url;
            existing.updated_at = update.updated_at;
        } else {
            state.profiles.push(update);
        }
        Ok(())
    }
}

impl ChangeFeed for MemoryDataStore {
    fn subscribe(&self) -> Result<Subscription, Error> {
        let (tx, rx) = unbounded_channel();
        self.0.lock().subscribers.push(tx);
        Ok(Subscription::new(rx, None))
    }
}

/// Index a list of rows by id.
#[must_use]
pub fn events_by_id(events: &[Event]) -> HashMap<StackString, Event> {
    events.iter().map(|e| (e.id.clone(), e.clone())).collect()
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use time::{Duration, macros::datetime};

    use crate::{
        change_feed::{ChangeEvent, ChangeFeed},
        config::{Config, ConfigInner},
        datastore::{DataStore, MemoryDataStore, RestDataStore},
        models::{EventData, EventInsert},
        timezone::TimeZone,
    };

    fn insert(title: &str) -> EventInsert {
        let data = EventData {
            title: title.into(),
            start_time: "2026-10-20T18:00".into(),
            ..EventData::default()
        };
        EventInsert {
            created_by: "u1".into(),
            patch: data.validate(TimeZone::utc()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_echoes_mutations() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        let mut sub = store.subscribe()?;

        let event = store.insert_event(&insert("Dinner")).await?;
        assert_eq!(event.end_time - event.start_time, Duration::hours(1));
        assert_eq!(sub.try_recv(), Some(ChangeEvent::Inserted(event.clone())));

        let mut patch = insert("Late dinner").patch;
        patch.start_time = datetime!(2026-10-20 20:00:00 UTC);
        patch.end_time = datetime!(2026-10-20 21:00:00 UTC);
        store.update_event(&event.id, &patch).await?;
        match sub.try_recv() {
            Some(ChangeEvent::Updated(updated)) => {
                assert_eq!(updated.id, event.id);
                assert_eq!(updated.title.as_str(), "Late dinner");
                assert_eq!(updated.created_by.as_str(), "u1");
            }
            other => panic!("unexpected {other:?}"),
        }

        store.delete_event(&event.id).await?;
        assert_eq!(
            sub.try_recv(),
            Some(ChangeEvent::Deleted {
                id: event.id.clone()
            })
        );
        store.delete_event(&event.id).await?;
        assert_eq!(sub.try_recv(), None);
        assert!(store.fetch_event(&event.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_store_failure() -> Result<(), Error> {
        let store = MemoryDataStore::new();
        store.fail_next("backend unavailable");
        assert!(store.fetch_events().await.is_err());
        assert!(store.fetch_events().await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_rest_urls() -> Result<(), Error> {
        let config = Config::from_inner(ConfigInner {
            backend_url: "https://abc.example.co".into(),
            ..ConfigInner::default()
        });
        let store = RestDataStore::new(&config)?;
        assert_eq!(
            store.table_url("events")?.as_str(),
            "https://abc.example.co/rest/v1/events"
        );
        Ok(())
    }
}
