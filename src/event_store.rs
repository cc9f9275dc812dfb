//! Consumed contract of the remote event store.
//!
//! The event store is an external service reached over RPC. This module names
//! the three calls the runtime needs from it and the registry through which a
//! [`Context`] hands out ready clients by logical name. Replay uses the client
//! registered as [`EVENT_SOURCE_QUERY`], appends use [`EVENT_SOURCE_COMMAND`];
//! both may point to the same client.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::context::Context;
use crate::error::Error;
use crate::event::{Event, Query};

/// Logical name of the client answering range queries.
pub const EVENT_SOURCE_QUERY: &str = "event_source_query";

/// Logical name of the client accepting appends and snapshots.
pub const EVENT_SOURCE_COMMAND: &str = "event_source_command";

/// Events of one aggregate in ascending version order. Ends at end-of-stream;
/// a mid-stream error is yielded as is.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Error>> + Send>>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Streams the events of `query.aggregate_id()` within the query bounds.
    async fn list(&self, ctx: &Context, query: Query) -> Result<EventStream, Error>;

    /// Appends one event. Fails with [`Error::Conflict`] when its version is
    /// already taken for the aggregate.
    async fn append(&self, ctx: &Context, event: Event) -> Result<(), Error>;

    /// Stores a snapshot event.
    async fn append_snapshot(&self, ctx: &Context, event: Event) -> Result<(), Error>;
}

/// Event store clients by logical name.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn EventStore>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the same client for queries and commands.
    pub fn single(client: Arc<dyn EventStore>) -> Self {
        Self::new()
            .with(EVENT_SOURCE_QUERY, client.clone())
            .with(EVENT_SOURCE_COMMAND, client)
    }

    pub fn with(mut self, name: impl Into<String>, client: Arc<dyn EventStore>) -> Self {
        self.register(name, client);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn EventStore>) {
        self.clients.insert(name.into(), client);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EventStore>, Error> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ClientNotAvailable(name.to_string()))
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.clients.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("ClientRegistry")
            .field("clients", &names)
            .finish()
    }
}
