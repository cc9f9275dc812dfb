use async_trait::async_trait;
use bytes::Bytes;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, EventData, ExpectedRevision,
    ReadStreamOptions, StreamPosition,
};
use prost::Message;
use serde_json::json;
use uuid::Uuid;

use crate::context::Context;
use crate::error::Error;
use crate::event::{Event, Query};
use crate::event_store::{EventStore, EventStream};

/// Name of a KurrentDB stream.
#[derive(Debug, Clone)]
struct StreamRef(String);

impl StreamRef {
    fn events(id: &str) -> Self {
        Self(id.to_string())
    }

    fn snapshots(id: &str) -> Self {
        Self(format!("{id}-snapshots"))
    }
}

impl eventstore::StreamName for StreamRef {
    fn into_stream_name(self) -> Bytes {
        Bytes::from(self.0)
    }
}

/// [`EventStore`] backed by KurrentDB.
///
/// Each aggregate is one stream named after its id; aggregate version `v` is
/// stream revision `v - 1`, so the expected-revision check of KurrentDB is the
/// optimistic concurrency check. Snapshots live in a side stream
/// `{id}-snapshots` and do not take part in the version sequence.
#[derive(Clone)]
pub struct Kurrent {
    client: Client,
}

impl Kurrent {
    /// Builds a client from an `esdb://` connection string. Does not connect.
    pub fn new(connection_str: &str) -> Result<Self, Error> {
        let settings = connection_str
            .parse::<ClientSettings>()
            .map_err(|e| Error::InvalidConfig {
                message: format!("{e:?}"),
                parameter: Some("connection_string".to_string()),
            })?;
        let client = Client::new(settings).map_err(|e| Error::InvalidConfig {
            message: format!("{e:?}"),
            parameter: Some("connection_string".to_string()),
        })?;
        Ok(Kurrent { client })
    }

    fn expected_revision(version: u64) -> ExpectedRevision {
        match version {
            0 | 1 => ExpectedRevision::NoStream,
            v => ExpectedRevision::Exact(v - 2),
        }
    }

    fn event_data(event: &Event) -> Result<EventData, Error> {
        let data = EventData::binary(event.topic.as_str(), Bytes::from(event.encode_to_vec()))
            .id(Uuid::new_v4())
            .metadata_as_json(&json!({
                "aggregate_id": event.aggregate_id(),
                "version": event.version(),
                "origin_name": event.origin_name,
            }))?;
        Ok(data)
    }
}

#[async_trait]
impl EventStore for Kurrent {
    async fn list(&self, _ctx: &Context, query: Query) -> Result<EventStream, Error> {
        let id = query.aggregate_id().unwrap_or_default().to_string();
        let lowest = query.lowest_version().max(1);
        let highest = query.highest_version();

        let mut options = ReadStreamOptions::default()
            .forwards()
            .position(StreamPosition::Position(lowest - 1));
        if highest != 0 {
            if highest < lowest {
                return Ok(Box::pin(futures::stream::empty()));
            }
            options = options.max_count((highest - lowest + 1) as usize);
        }

        let stream = match self.client.read_stream(StreamRef::events(&id), &options).await {
            Ok(stream) => stream,
            Err(eventstore::Error::ResourceNotFound) => {
                return Ok(Box::pin(futures::stream::empty()));
            }
            Err(e) => return Err(e.into()),
        };

        let events = futures::stream::try_unfold(stream, |mut stream| async move {
            match stream.next().await {
                Ok(Some(resolved)) => {
                    let recorded = resolved.get_original_event();
                    let event = Event::decode(recorded.data.clone())?;
                    Ok(Some((event, stream)))
                }
                Ok(None) | Err(eventstore::Error::ResourceNotFound) => Ok(None),
                Err(e) => Err(Error::from(e)),
            }
        });
        Ok(Box::pin(events))
    }

    async fn append(&self, _ctx: &Context, event: Event) -> Result<(), Error> {
        let id = event.aggregate_id().to_string();
        let version = event.version();
        let options = AppendToStreamOptions::default()
            .expected_revision(Self::expected_revision(version));

        match self
            .client
            .append_to_stream(StreamRef::events(&id), &options, Self::event_data(&event)?)
            .await
        {
            Ok(_) => Ok(()),
            Err(eventstore::Error::WrongExpectedVersion { .. }) => Err(Error::Conflict {
                aggregate_id: id,
                version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_snapshot(&self, _ctx: &Context, event: Event) -> Result<(), Error> {
        let options = AppendToStreamOptions::default().expected_revision(ExpectedRevision::Any);
        self.client
            .append_to_stream(
                StreamRef::snapshots(event.aggregate_id()),
                &options,
                Self::event_data(&event)?,
            )
            .await?;
        Ok(())
    }
}
