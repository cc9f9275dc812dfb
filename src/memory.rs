//! In-memory event store.
//!
//! Keeps one ordered log per aggregate id and enforces the same version rule as
//! the remote service: an append must claim exactly the next version. Useful for
//! tests and for running a service locally without the event store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Error;
use crate::event::{Event, Query};
use crate::event_store::{EventStore, EventStream};

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, Vec<Event>>,
    snapshots: HashMap<String, Vec<Event>>,
    /// Writes committed by "another writer", one before each append.
    interleaved: VecDeque<Event>,
    unavailable: bool,
    list_calls: usize,
    append_calls: usize,
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `events` as already persisted history, bypassing version checks.
    pub fn seed(&self, events: impl IntoIterator<Item = Event>) {
        let mut inner = self.lock();
        for event in events {
            inner
                .streams
                .entry(event.aggregate_id().to_string())
                .or_default()
                .push(event);
        }
    }

    /// Queues `event` to be committed just before an append is checked, as if
    /// a concurrent writer won the race. One queued event is committed per append.
    pub fn interleave_before_next_append(&self, event: Event) {
        self.lock().interleaved.push_back(event);
    }

    /// Makes every call fail as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn events(&self, id: &str) -> Vec<Event> {
        self.lock().streams.get(id).cloned().unwrap_or_default()
    }

    pub fn snapshots(&self, id: &str) -> Vec<Event> {
        self.lock().snapshots.get(id).cloned().unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }

    fn check_available(inner: &Inner) -> Result<(), Error> {
        if inner.unavailable {
            return Err(Error::Status(tonic::Status::unavailable(
                "event store unavailable",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn list(&self, _ctx: &Context, query: Query) -> Result<EventStream, Error> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        Self::check_available(&inner)?;

        let id = query.aggregate_id().unwrap_or_default();
        let (lowest, highest) = (query.lowest_version(), query.highest_version());
        let events = inner
            .streams
            .get(id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| lowest == 0 || e.version() >= lowest)
                    .filter(|e| highest == 0 || e.version() <= highest)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    async fn append(&self, _ctx: &Context, event: Event) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.append_calls += 1;
        Self::check_available(&inner)?;

        if let Some(other) = inner.interleaved.pop_front() {
            inner
                .streams
                .entry(other.aggregate_id().to_string())
                .or_default()
                .push(other);
        }

        let id = event.aggregate_id().to_string();
        let stream = inner.streams.entry(id.clone()).or_default();
        let next = stream.last().map(Event::version).unwrap_or_default() + 1;
        if event.version() != next {
            return Err(Error::Conflict {
                aggregate_id: id,
                version: event.version(),
            });
        }
        stream.push(event);
        Ok(())
    }

    async fn append_snapshot(&self, _ctx: &Context, event: Event) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.append_calls += 1;
        Self::check_available(&inner)?;
        inner
            .snapshots
            .entry(event.aggregate_id().to_string())
            .or_default()
            .push(event);
        Ok(())
    }
}
