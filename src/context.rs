//! Processing context passed explicitly to every operation.
//!
//! A [`Context`] carries what the surrounding service provides to the runtime:
//! the origin of produced events, the registry of event store clients, the
//! correlation id of the message being handled, the tracing span every log line
//! is emitted under, and the cancellation signal of the subscription it was
//! derived from.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::Error;
use crate::event_store::{ClientRegistry, EventStore};

/// Provenance stamped on every event this process produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone)]
pub struct Context {
    origin: Arc<Origin>,
    clients: Arc<ClientRegistry>,
    eid: Option<String>,
    span: Span,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(origin_name: impl Into<String>, clients: ClientRegistry) -> Self {
        let origin = Origin {
            name: origin_name.into(),
            ip: "127.0.0.1".to_string(),
        };
        let span = tracing::info_span!("service", name = %origin.name);
        Self {
            origin: Arc::new(origin),
            clients: Arc::new(clients),
            eid: None,
            span,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_origin_ip(self, ip: impl Into<String>) -> Self {
        let origin = Origin {
            name: self.origin.name.clone(),
            ip: ip.into(),
        };
        Self {
            origin: Arc::new(origin),
            ..self
        }
    }

    /// Ties the context to an external shutdown signal.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    /// Derives a context carrying `eid`, with a child span recording it.
    pub fn with_eid(&self, eid: impl Into<String>) -> Self {
        let eid = eid.into();
        let span = tracing::info_span!(parent: &self.span, "eid", eid = %eid);
        Self {
            eid: Some(eid),
            span,
            ..self.clone()
        }
    }

    /// Derives a context whose cancellation can be triggered without
    /// cancelling this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn eid(&self) -> Option<&str> {
        self.eid.as_deref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn client(&self, name: &str) -> Result<Arc<dyn EventStore>, Error> {
        self.clients.get(name)
    }
}
