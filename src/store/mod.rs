//! Aggregate reconstruction and optimistic-concurrency dispatch.
//!
//! A [`Store`] is a transient view over the remote event log of one aggregate.
//! It is created for a single operation, fed by replaying events through a
//! domain apply function, and dropped afterwards. Nothing is cached between
//! operations: the event store is the only authority on versions.
//!
//! [`Store::append_with_retry`] is the write path. It rebuilds the aggregate,
//! runs validators, claims the next version and retries the whole cycle when a
//! concurrent writer claimed that version first.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pluto_es::{
//!     AggregateId, ClientRegistry, Context, Dispatch, Error, Event, ExecuteConfig, Store,
//! };
//! use pluto_es::memory::InMemoryEventStore;
//! use std::sync::Arc;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Account {
//!     #[prost(int64, tag = "1")]
//!     balance: i64,
//! }
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Deposited {
//!     #[prost(int64, tag = "1")]
//!     amount: i64,
//! }
//!
//! fn apply(event: &Event, state: &Account) -> Result<Account, Error> {
//!     let deposited = event.decode_data::<Deposited>()?;
//!     Ok(Account { balance: state.balance + deposited.amount })
//! }
//!
//! # async fn example() -> Result<(), Error> {
//! let clients = ClientRegistry::single(Arc::new(InMemoryEventStore::new()));
//! let ctx = Context::new("accounts", clients);
//!
//! let id = AggregateId::try_new("acct-1".to_string())?;
//! let dispatch = Dispatch::new(id, "deposited", Deposited { amount: 10 })
//!     .validate(|store: &Store<Account>| {
//!         if store.state.balance > 1_000 {
//!             return Err(Error::domain("balance limit reached"));
//!         }
//!         Ok(())
//!     });
//!
//! let store = Store::append_with_retry(
//!     &ctx,
//!     Account::default(),
//!     &dispatch,
//!     &apply,
//!     &ExecuteConfig::default(),
//! )
//! .await?;
//! assert_eq!(store.version, 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use futures::TryStreamExt;

use crate::config::ExecuteConfig;
use crate::context::Context;
use crate::error::Error;
use crate::event::{Aggregate, AggregateId, EID_KEY, Event, Format, Query, schema_of};
use crate::event_store::{EVENT_SOURCE_COMMAND, EVENT_SOURCE_QUERY};

/// Check run against the rebuilt aggregate before an event is appended.
pub type Validate<S> = Box<dyn Fn(&Store<S>) -> Result<(), Error> + Send + Sync>;

/// Aggregate state rebuilt from a range of its events.
#[derive(Debug, Clone, PartialEq)]
pub struct Store<S> {
    pub state: S,
    /// Version of the last applied event, `0` when nothing was applied.
    pub version: u64,
    /// Inclusive lower replay bound, `0` for unbounded.
    pub lowest_version: u64,
    /// Inclusive upper replay bound, `0` for unbounded.
    pub highest_version: u64,
}

impl<S> Store<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            version: 0,
            lowest_version: 0,
            highest_version: 0,
        }
    }

    /// Restricts replay to `[lowest_version, highest_version]`.
    pub fn with_range(self, lowest_version: u64, highest_version: u64) -> Self {
        Self {
            lowest_version,
            highest_version,
            ..self
        }
    }

    /// Streams the events of `id` within the replay bounds and applies them in
    /// order. A stream error aborts the replay and is returned unchanged.
    pub async fn load_events<F>(&mut self, ctx: &Context, id: &str, apply: &F) -> Result<(), Error>
    where
        F: Fn(&Event, &S) -> Result<S, Error> + ?Sized,
    {
        let client = ctx.client(EVENT_SOURCE_QUERY)?;
        let query = Query::range(id, self.lowest_version, self.highest_version);
        let mut events = client.list(ctx, query).await?;

        let mut applied = 0usize;
        while let Some(event) = events.try_next().await? {
            self.apply(&event, apply)?;
            applied += 1;
        }

        tracing::debug!(
            parent: ctx.span(),
            aggregate_id = id,
            applied,
            version = self.version,
            "events loaded"
        );
        Ok(())
    }

    /// Applies `event` to the state. On error the store is left untouched.
    pub fn apply<F>(&mut self, event: &Event, apply: &F) -> Result<(), Error>
    where
        F: Fn(&Event, &S) -> Result<S, Error> + ?Sized,
    {
        self.state = apply(event, &self.state)?;
        self.version = event.version();
        Ok(())
    }
}

impl<S: Clone> Store<S> {
    /// Rebuilds the aggregate, validates, and appends a new event claiming the
    /// next version.
    ///
    /// When the append is rejected because the version was taken meanwhile, the
    /// whole cycle runs again after a jittered backoff, at most
    /// `config.max_retries()` times. Any other failure is returned right away.
    /// On success the appended event has been applied to the returned store.
    pub async fn append_with_retry<M, F>(
        ctx: &Context,
        initial: S,
        dispatch: &Dispatch<S, M>,
        apply: &F,
        config: &ExecuteConfig,
    ) -> Result<Store<S>, Error>
    where
        M: prost::Message,
        F: Fn(&Event, &S) -> Result<S, Error> + ?Sized,
    {
        let command = ctx.client(EVENT_SOURCE_COMMAND)?;
        let id = dispatch.id.as_str();
        let mut retries = 0;

        let result = loop {
            let mut store = Store::new(initial.clone());
            if let Err(e) = store.load_events(ctx, id, apply).await {
                break Err(e);
            }

            if let Err(e) = dispatch.validations.iter().try_for_each(|v| v(&store)) {
                break Err(e);
            }

            let event = dispatch.event(ctx, store.version + 1);

            match command.append(ctx, event.clone()).await {
                Ok(()) => {
                    break store.apply(&event, apply).map(|()| store);
                }
                Err(Error::Conflict { .. }) if retries >= config.max_retries() => {
                    break Err(Error::MaxRetriesExceeded {
                        aggregate_id: id.to_string(),
                        max_retries: config.max_retries(),
                    });
                }
                Err(Error::Conflict { version, .. }) => {
                    let delay = config.retry_delay().calculate_delay(retries);
                    tracing::warn!(
                        parent: ctx.span(),
                        aggregate_id = id,
                        version,
                        attempt = retries + 1,
                        ?delay,
                        "version conflict, retrying dispatch"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                    continue;
                }
                Err(e) => {
                    break Err(e);
                }
            }
        };

        if let Ok(store) = &result {
            tracing::info!(
                parent: ctx.span(),
                aggregate_id = id,
                topic = %dispatch.topic,
                version = store.version,
                "event dispatched"
            );
        }
        result
    }
}

/// A new event to append to an aggregate, with the checks it must pass.
pub struct Dispatch<S, M> {
    id: AggregateId,
    topic: String,
    input: M,
    metadata: HashMap<String, String>,
    validations: Vec<Validate<S>>,
}

impl<S, M: prost::Message> Dispatch<S, M> {
    pub fn new(id: AggregateId, topic: impl Into<String>, input: M) -> Self {
        Self {
            id,
            topic: topic.into(),
            input,
            metadata: HashMap::new(),
            validations: Vec::new(),
        }
    }

    /// Metadata copied into the appended event.
    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds a validator. Validators run in the order they were added.
    pub fn validate<V>(mut self, validation: V) -> Self
    where
        V: Fn(&Store<S>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.validations.push(Box::new(validation));
        self
    }

    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    fn event(&self, ctx: &Context, version: u64) -> Event {
        let mut metadata = self.metadata.clone();
        if let Some(eid) = ctx.eid() {
            metadata.insert(EID_KEY.to_string(), eid.to_string());
        }

        let mut aggregate = Aggregate {
            id: self.id.to_string(),
            schema: schema_of::<M>(),
            data: self.input.encode_to_vec(),
            version,
            metadata,
            ..Default::default()
        };
        aggregate.set_format(Format::Protobuf);

        Event {
            topic: self.topic.clone(),
            aggregate: Some(aggregate),
            origin_name: ctx.origin().name.clone(),
            origin_ip: ctx.origin().ip.clone(),
        }
    }
}
