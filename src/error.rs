/// Error types for the pluto-es event sourcing runtime.
///
/// A single enum covers every failure the store, the snapshot policy, the action
/// wrappers and the subscription runner can surface. Variants are grouped by how
/// they are handled: structural and serialization errors are terminal, conflicts
/// are retried by dispatch, remote errors are surfaced to the caller.
use std::fmt::Debug;
use thiserror::Error;

use crate::event::AggregateIdError;
use crate::pubsub::PubSubError;

/// Boxed error returned by domain code (apply functions, hooks, validators).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur in the pluto-es runtime
#[derive(Debug, Error)]
pub enum Error {
    /// The event carries no aggregate envelope
    #[error("event can not contain nil as aggregate")]
    EventWithoutAggregate,

    /// The aggregate id is empty
    #[error("event can not have an empty string as aggregate id")]
    InvalidAggregateId,

    /// The aggregate version is 0
    #[error("event can not have 0 as version")]
    InvalidVersion,

    /// Another writer already claimed the version for this aggregate
    #[error("Version conflict for aggregate '{aggregate_id}': version {version} already exists")]
    Conflict { aggregate_id: String, version: u64 },

    /// Indicates that maximum retry attempts were exceeded
    #[error("Dispatch exceeded maximum retries ({max_retries}) for aggregate '{aggregate_id}'")]
    MaxRetriesExceeded {
        aggregate_id: String,
        max_retries: u32,
    },

    /// The payload could not be encoded
    #[error(transparent)]
    Encode(#[from] prost::EncodeError),

    /// The payload could not be decoded
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),

    /// The aggregate format is not one this runtime can decode
    #[error("format not supported: {0}")]
    FormatNotSupported(i32),

    /// No client is registered under the requested name
    #[error("{0} client not available")]
    ClientNotAvailable(String),

    /// The event store answered with an error status
    #[error(transparent)]
    Status(#[from] tonic::Status),

    /// The connection to the event store could not be established
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    /// Indicates a KurrentDB error
    #[error(transparent)]
    EventStore(#[from] eventstore::Error),

    /// Indicates a failure to serialize metadata
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Indicates a pub/sub transport error
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    /// The apply function, a hook or a validator rejected the transition
    #[error("{0}")]
    Domain(#[source] BoxError),

    /// The deployment environment is not set
    #[error("GCP_PROJECT_ENV not defined")]
    EnvironmentNotDefined,

    /// Indicates an invalid configuration parameter
    #[error("Invalid configuration{}: {message}", parameter.as_ref().map(|p| format!(" parameter '{p}'")).unwrap_or_default())]
    InvalidConfig {
        message: String,
        parameter: Option<String>,
    },
}

impl Error {
    /// Wraps a domain error.
    pub fn domain<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Domain(err.into())
    }

    /// True for the structural validation failures.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::EventWithoutAggregate | Self::InvalidAggregateId | Self::InvalidVersion
        )
    }

    pub(crate) fn invalid_config(message: impl Into<String>, parameter: &str) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            parameter: Some(parameter.to_string()),
        }
    }
}

impl From<AggregateIdError> for Error {
    fn from(_: AggregateIdError) -> Self {
        Self::InvalidAggregateId
    }
}
