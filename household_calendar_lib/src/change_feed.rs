use anyhow::{Error, format_err};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use stack_string::StackString;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel},
    task::JoinHandle,
    time::interval,
};

use crate::{
    datastore::{DataStore, events_by_id},
    models::Event,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A single row change on the `events` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Inserted(Event),
    Updated(Event),
    Deleted { id: StackString },
}

impl ChangeEvent {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Inserted(_) => ChangeKind::Inserted,
            Self::Updated(_) => ChangeKind::Updated,
            Self::Deleted { .. } => ChangeKind::Deleted,
        }
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::Inserted(event) | Self::Updated(event) => event.id.as_str(),
            Self::Deleted { id } => id.as_str(),
        }
    }
}

/// Change notification as delivered by the backend's realtime channel.
///
/// `row` carries the full new row for inserts and updates, and at least the
/// `id` for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub kind: ChangeKind,
    pub table: StackString,
    pub row: serde_json::Value,
}

#[derive(Deserialize)]
struct DeletedRow {
    id: StackString,
}

impl TryFrom<ChangeMessage> for ChangeEvent {
    type Error = Error;

    fn try_from(msg: ChangeMessage) -> Result<Self, Self::Error> {
        if msg.table.as_str() != "events" {
            return Err(format_err!("Unexpected table {}", msg.table));
        }
        match msg.kind {
            ChangeKind::Inserted => Ok(Self::Inserted(serde_json::from_value(msg.row)?)),
            ChangeKind::Updated => Ok(Self::Updated(serde_json::from_value(msg.row)?)),
            ChangeKind::Deleted => {
                let DeletedRow { id } = serde_json::from_value(msg.row)?;
                Ok(Self::Deleted { id })
            }
        }
    }
}

/// Handle to an open change subscription.
///
/// Dropping it (or calling `unsubscribe`) stops delivery and any producer task.
pub struct Subscription {
    receiver: UnboundedReceiver<ChangeEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn new(receiver: UnboundedReceiver<ChangeEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { receiver, task }
    }

    /// Next change, or `None` once the feed has closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.try_recv() {
            Ok(change) => Some(change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.receiver.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

pub trait ChangeFeed {
    /// # Errors
    /// Returns error if the feed can't be opened
    fn subscribe(&self) -> Result<Subscription, Error>;
}

/// Turn two snapshots of the events table into row changes.
///
/// Inserts and updates come in the order of `new`, deletes follow sorted by id.
#[must_use]
pub fn diff_snapshots(old: &HashMap<StackString, Event>, new: &[Event]) -> Vec<ChangeEvent> {
    let mut changes: Vec<ChangeEvent> = new
        .iter()
        .filter_map(|event| match old.get(&event.id) {
            None => Some(ChangeEvent::Inserted(event.clone())),
            Some(previous) if previous != event => Some(ChangeEvent::Updated(event.clone())),
            Some(_) => None,
        })
        .collect();
    let current: HashSet<&str> = new.iter().map(|e| e.id.as_str()).collect();
    let mut deleted: Vec<&StackString> = old
        .keys()
        .filter(|id| !current.contains(id.as_str()))
        .collect();
    deleted.sort();
    changes.extend(
        deleted
            .into_iter()
            .map(|id| ChangeEvent::Deleted { id: id.clone() }),
    );
    changes
}

/// Consecutive failed reads after which a polling feed closes.
pub const MAX_POLL_FAILURES: usize = 5;

/// Change feed for backends without a push channel: re-reads the events table
/// every `period` and reports the differences. The subscription closes after
/// `MAX_POLL_FAILURES` failed reads in a row.
pub struct PollingChangeFeed<D> {
    store: Arc<D>,
    period: Duration,
    baseline: Vec<Event>,
}

impl<D> PollingChangeFeed<D>
where
    D: DataStore + 'static,
{
    #[must_use]
    pub fn new(store: Arc<D>, period: Duration) -> Self {
        Self {
            store,
            period,
            baseline: Vec::new(),
        }
    }

    /// Rows already known to the subscriber; they won't be reported as inserts.
    #[must_use]
    pub fn with_baseline(mut self, events: Vec<Event>) -> Self {
        self.baseline = events;
        self
    }

    async fn poll_loop(
        store: Arc<D>,
        period: Duration,
        baseline: Vec<Event>,
        sender: UnboundedSender<ChangeEvent>,
    ) {
        let mut known = events_by_id(&baseline);
        let mut ticker = interval(period);
        let mut failures = 0;
        loop {
            ticker.tick().await;
            if sender.is_closed() {
                return;
            }
            let events = match store.fetch_events().await {
                Ok(events) => {
                    failures = 0;
                    events
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_POLL_FAILURES {
                        error!("poll failed {failures} times, closing feed: {e}");
                        return;
                    }
                    warn!("poll failed ({failures}/{MAX_POLL_FAILURES}) {e}");
                    continue;
                }
            };
            let changes = diff_snapshots(&known, &events);
            if !changes.is_empty() {
                debug!("poll found {} changes", changes.len());
            }
            for change in changes {
                if sender.send(change).is_err() {
                    return;
                }
            }
            known = events_by_id(&events);
        }
    }
}

impl<D> ChangeFeed for PollingChangeFeed<D>
where
    D: DataStore + 'static,
{
    fn subscribe(&self) -> Result<Subscription, Error> {
        if self.period.is_zero() {
            return Err(format_err!("poll interval must be positive"));
        }
        let (tx, rx) = unbounded_channel();
        let task = tokio::spawn(Self::poll_loop(
            self.store.clone(),
            self.period,
            self.baseline.clone(),
            tx,
        ));
        Ok(Subscription::new(rx, Some(task)))
    }
}
