//! Snapshot policy.
//!
//! A snapshot is a regular [`Event`] whose payload is the full aggregate state
//! after a given version. It is sent to the snapshot command of the event store
//! and never contends on the version sequence of domain events.

use crate::context::Context;
use crate::error::Error;
use crate::event::{Aggregate, Event, Format, schema_of};
use crate::event_store::EVENT_SOURCE_COMMAND;
use crate::store::Store;

/// Topic of snapshot events.
pub const SNAPSHOT_CREATED: &str = "snapshot_created";

/// True when `event` lands on a multiple of `factor`.
///
/// A factor of zero or below, a missing aggregate, or version `0` never
/// triggers a snapshot.
pub fn is_snapshot_time(event: &Event, factor: i64) -> bool {
    if factor <= 0 {
        return false;
    }
    match event.version() {
        0 => false,
        version => version % factor as u64 == 0,
    }
}

/// Replays `[1, event.version]` and appends the resulting state as a
/// snapshot of the same aggregate at the same version.
///
/// The append is attempted once. Its failure is returned to the caller.
pub async fn take_snapshot<S, F>(
    ctx: &Context,
    event: &Event,
    initial: S,
    apply: &F,
) -> Result<(), Error>
where
    S: prost::Message,
    F: Fn(&Event, &S) -> Result<S, Error> + ?Sized,
{
    let id = event.validate()?;
    let version = event.version();

    let mut store = Store::new(initial).with_range(1, version);
    store.load_events(ctx, &id, apply).await?;

    let mut aggregate = Aggregate {
        id: id.to_string(),
        schema: schema_of::<S>(),
        data: store.state.encode_to_vec(),
        version,
        ..Default::default()
    };
    aggregate.set_format(Format::Protobuf);

    let snapshot = Event {
        topic: SNAPSHOT_CREATED.to_string(),
        aggregate: Some(aggregate),
        origin_name: ctx.origin().name.clone(),
        origin_ip: ctx.origin().ip.clone(),
    };

    ctx.client(EVENT_SOURCE_COMMAND)?
        .append_snapshot(ctx, snapshot)
        .await?;

    tracing::info!(
        parent: ctx.span(),
        aggregate_id = %id,
        version,
        replayed = store.version,
        "snapshot taken"
    );
    Ok(())
}
