//! Wire model for events flowing through the event-sourcing runtime.
//!
//! An [`Event`] is the unit of fact: an immutable, versioned change to one
//! aggregate. The same message is used on every wire this crate touches: it is
//! what the remote event store streams back on replay, what the command service
//! accepts on append, and what arrives as the payload of a pub/sub delivery.
//!
//! Events are encoded with protobuf through `prost`. The domain payload inside
//! [`Aggregate::data`] is opaque to the runtime and is only ever decoded by the
//! domain apply function, usually through [`Event::decode_data`].
//!
//! # Examples
//!
//! ```rust
//! use pluto_es::{Aggregate, Event, Format};
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! struct Deposited {
//!     #[prost(int64, tag = "1")]
//!     amount: i64,
//! }
//!
//! let mut aggregate = Aggregate {
//!     id: "acct-1".to_string(),
//!     version: 1,
//!     ..Default::default()
//! };
//! aggregate.set_format(Format::Protobuf);
//!
//! let mut event = Event {
//!     topic: "deposited".to_string(),
//!     aggregate: Some(aggregate),
//!     ..Default::default()
//! };
//! event.encode_data(&Deposited { amount: 10 });
//!
//! let id = event.validate().unwrap();
//! assert_eq!(id.as_str(), "acct-1");
//! assert_eq!(event.decode_data::<Deposited>().unwrap().amount, 10);
//! ```

use std::collections::HashMap;

use nutype::nutype;

use crate::error::Error;

/// Metadata key carrying the correlation (execution) id.
pub const EID_KEY: &str = "eid";

/// Identifier of an aggregate instance. Never empty.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deref, Serialize, Deserialize)
)]
pub struct AggregateId(String);

/// Serialization format of [`Aggregate::data`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Format {
    Protobuf = 0,
}

/// Aggregate envelope carried by every [`Event`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct Aggregate {
    #[prost(string, tag = "1")]
    pub id: String,
    /// Name of the domain type `data` decodes to. Diagnostic only.
    #[prost(string, tag = "2")]
    pub schema: String,
    #[prost(enumeration = "Format", tag = "3")]
    pub format: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
    /// Position of this event in the aggregate's history, starting at 1.
    #[prost(uint64, tag = "5")]
    pub version: u64,
    #[prost(map = "string, string", tag = "6")]
    pub metadata: HashMap<String, String>,
}

/// An immutable fact about one aggregate.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Event {
    /// Business event type, used for routing.
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(message, optional, tag = "2")]
    pub aggregate: Option<Aggregate>,
    /// Name of the process that produced the event.
    #[prost(string, tag = "3")]
    pub origin_name: String,
    #[prost(string, tag = "4")]
    pub origin_ip: String,
}

/// Range query sent to the event store projection service.
///
/// Keys are `AID` (aggregate id), `LV` (lowest version) and `HV` (highest
/// version); a bound that is not present is unbounded.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Query {
    #[prost(map = "string, string", tag = "1")]
    pub params: HashMap<String, String>,
}

/// Acknowledgment returned by the event store command service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Ack {}

impl Query {
    pub const AGGREGATE_ID: &'static str = "AID";
    pub const LOWEST_VERSION: &'static str = "LV";
    pub const HIGHEST_VERSION: &'static str = "HV";

    /// Builds a range query. A bound of `0` is left out of the params.
    pub fn range(id: &str, lowest_version: u64, highest_version: u64) -> Self {
        let mut params = HashMap::from([(Self::AGGREGATE_ID.to_string(), id.to_string())]);
        if lowest_version != 0 {
            params.insert(Self::LOWEST_VERSION.to_string(), lowest_version.to_string());
        }
        if highest_version != 0 {
            params.insert(Self::HIGHEST_VERSION.to_string(), highest_version.to_string());
        }
        Self { params }
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.params.get(Self::AGGREGATE_ID).map(String::as_str)
    }

    /// Lowest version requested, `0` when unbounded or unparsable.
    pub fn lowest_version(&self) -> u64 {
        self.bound(Self::LOWEST_VERSION)
    }

    /// Highest version requested, `0` when unbounded or unparsable.
    pub fn highest_version(&self) -> u64 {
        self.bound(Self::HIGHEST_VERSION)
    }

    fn bound(&self, key: &str) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

impl Event {
    /// Checks the event is structurally usable and returns its aggregate id.
    ///
    /// An event without an aggregate, with an empty aggregate id, or with
    /// version 0 is rejected.
    pub fn validate(&self) -> Result<AggregateId, Error> {
        let aggregate = self.aggregate.as_ref().ok_or(Error::EventWithoutAggregate)?;
        if aggregate.version == 0 {
            return Err(Error::InvalidVersion);
        }
        Ok(AggregateId::try_new(aggregate.id.clone())?)
    }

    /// Version of the aggregate after this event, `0` when there is no aggregate.
    pub fn version(&self) -> u64 {
        self.aggregate.as_ref().map(|a| a.version).unwrap_or_default()
    }

    pub fn aggregate_id(&self) -> &str {
        self.aggregate.as_ref().map(|a| a.id.as_str()).unwrap_or_default()
    }

    /// Correlation id carried in the aggregate metadata, if any.
    pub fn eid(&self) -> Option<&str> {
        self.aggregate
            .as_ref()
            .and_then(|a| a.metadata.get(EID_KEY))
            .map(String::as_str)
            .filter(|eid| !eid.is_empty())
    }

    /// Decodes the domain payload according to the aggregate format.
    pub fn decode_data<M>(&self) -> Result<M, Error>
    where
        M: prost::Message + Default,
    {
        let aggregate = self.aggregate.as_ref().ok_or(Error::EventWithoutAggregate)?;
        match Format::try_from(aggregate.format) {
            Ok(Format::Protobuf) => Ok(M::decode(aggregate.data.as_slice())?),
            Err(_) => Err(Error::FormatNotSupported(aggregate.format)),
        }
    }

    /// Encodes `message` as the domain payload and records its schema.
    pub fn encode_data<M>(&mut self, message: &M)
    where
        M: prost::Message,
    {
        let aggregate = self.aggregate.get_or_insert_with(Aggregate::default);
        aggregate.set_format(Format::Protobuf);
        aggregate.schema = schema_of::<M>();
        aggregate.data = message.encode_to_vec();
    }
}

/// Schema name recorded for payloads of type `M`.
pub fn schema_of<M: ?Sized>() -> String {
    std::any::type_name::<M>().to_string()
}
