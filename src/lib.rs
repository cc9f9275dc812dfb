pub mod action;
mod config;
mod context;
mod delay;
mod error;
mod event;
mod event_store;
mod grpc_adapter;
mod kurrent_adapter;
pub mod memory;
pub mod pubsub;
pub mod snapshot;
mod store;

pub use action::{
    Action, ApplyFn, Hook, Topics, action_wrapper, action_wrapper_with, snapshot_action_wrapper,
};
pub use config::{
    ConnectionSettings, ConnectionSettingsBuilder, ExecuteConfig, PROJECT_ENV_VAR,
    SubscriberConfig,
};
pub use context::{Context, Origin};
pub use delay::RetryDelay;
pub use error::{BoxError, Error};
pub use event::{
    Ack, Aggregate, AggregateId, AggregateIdError, EID_KEY, Event, Format, Query, schema_of,
};
pub use event_store::{
    ClientRegistry, EVENT_SOURCE_COMMAND, EVENT_SOURCE_QUERY, EventStore, EventStream,
};
pub use grpc_adapter::GrpcEventStore;
pub use kurrent_adapter::Kurrent;
pub use pubsub::{PubSub, PubSubError, Subscriber};
pub use snapshot::{SNAPSHOT_CREATED, is_snapshot_time, take_snapshot};
pub use store::{Dispatch, Store, Validate};
