use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use crate::config::ConnectionSettings;
use crate::context::Context;
use crate::error::Error;
use crate::event::{Ack, EID_KEY, Event, Query};
use crate::event_store::{EventStore, EventStream};

const LIST_PATH: &str = "/es.EventSourceProjection/List";
const CREATE_PATH: &str = "/es.EventSourceCommand/Create";
const SNAPSHOT_PATH: &str = "/es.EventSourceCommand/Snapshot";

/// Event store client speaking the projection and command gRPC services.
///
/// The channel is shared by clones; each call waits for the channel to be
/// ready, bounded by the connect timeout of its [`ConnectionSettings`]. Unary
/// calls and every item of a replay stream are bounded by the request timeout.
#[derive(Debug, Clone)]
pub struct GrpcEventStore {
    channel: Channel,
    settings: ConnectionSettings,
}

impl GrpcEventStore {
    /// Creates a client that connects on first use.
    pub fn connect_lazy(settings: ConnectionSettings) -> Result<Self, Error> {
        let channel = endpoint(&settings)?.connect_lazy();
        Ok(Self { channel, settings })
    }

    /// Creates a client and establishes the connection right away.
    pub async fn connect(settings: ConnectionSettings) -> Result<Self, Error> {
        let channel = endpoint(&settings)?.connect().await?;
        Ok(Self { channel, settings })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    async fn ready(&self) -> Result<Grpc<Channel>, Error> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready().await?;
        Ok(grpc)
    }

    async fn command(&self, ctx: &Context, path: &'static str, event: Event) -> Result<(), Error> {
        let aggregate_id = event.aggregate_id().to_string();
        let version = event.version();

        let mut request = request(ctx, event);
        request.set_timeout(self.settings.request_timeout());

        let mut grpc = self.ready().await?;
        let codec = ProstCodec::<Event, Ack>::default();
        match grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if matches!(status.code(), Code::Aborted | Code::AlreadyExists) => {
                Err(Error::Conflict {
                    aggregate_id,
                    version,
                })
            }
            Err(status) => Err(Error::Status(status)),
        }
    }
}

#[async_trait]
impl EventStore for GrpcEventStore {
    async fn list(&self, ctx: &Context, query: Query) -> Result<EventStream, Error> {
        let mut grpc = self.ready().await?;
        let codec = ProstCodec::<Query, Event>::default();
        let mut request = request(ctx, query);
        request.set_timeout(self.settings.request_timeout());
        let response = grpc
            .server_streaming(request, PathAndQuery::from_static(LIST_PATH), codec)
            .await?;
        Ok(bounded(
            response.into_inner(),
            self.settings.request_timeout(),
        ))
    }

    async fn append(&self, ctx: &Context, event: Event) -> Result<(), Error> {
        self.command(ctx, CREATE_PATH, event).await
    }

    async fn append_snapshot(&self, ctx: &Context, event: Event) -> Result<(), Error> {
        self.command(ctx, SNAPSHOT_PATH, event).await
    }
}

fn endpoint(settings: &ConnectionSettings) -> Result<Endpoint, Error> {
    Ok(Endpoint::from_shared(settings.target().to_string())?
        .connect_timeout(settings.connect_timeout())
        .timeout(settings.request_timeout()))
}

/// Fails the stream with `DeadlineExceeded` when the server goes quiet for
/// longer than `limit` between two events.
fn bounded<S>(events: S, limit: Duration) -> EventStream
where
    S: Stream<Item = Result<Event, Status>> + Send + 'static,
{
    let events = tokio_stream::StreamExt::timeout(events, limit).map(move |item| match item {
        Ok(event) => event.map_err(Error::from),
        Err(_) => Err(Error::Status(Status::deadline_exceeded(format!(
            "no event received within {limit:?}"
        )))),
    });
    Box::pin(events)
}

/// Wraps `message` in a request carrying the context's correlation id.
fn request<T>(ctx: &Context, message: T) -> Request<T> {
    let mut request = Request::new(message);
    if let Some(eid) = ctx.eid() {
        match MetadataValue::<Ascii>::try_from(eid) {
            Ok(value) => {
                request.metadata_mut().insert(EID_KEY, value);
            }
            Err(_) => tracing::warn!(eid, "eid is not a valid header value"),
        }
    }
    request
}
