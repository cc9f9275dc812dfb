//! Configuration for dispatch, subscriptions and event store connections.
//!
//! All settings are plain values with validating setters. They implement
//! `serde` so a host service can load them from its own configuration source;
//! [`SubscriberConfig::from_env`] and [`ConnectionSettings::from_env`] cover the
//! environment variables used in deployments.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::delay::RetryDelay;
use crate::error::Error;

/// Environment variable naming the deployment environment (topic prefix).
pub const PROJECT_ENV_VAR: &str = "GCP_PROJECT_ENV";

/// Retry budget for [`Store::append_with_retry`](crate::Store::append_with_retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteConfig {
    max_retries: u32,
    retry_delay: RetryDelay,
}

impl ExecuteConfig {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }

    pub fn with_max_retries(self, max_retries: u32) -> Result<Self, Error> {
        if max_retries == 0 {
            return Err(Error::invalid_config(
                "max_retries cannot be 0",
                "max_retries",
            ));
        }
        Ok(Self {
            max_retries,
            ..self
        })
    }

    pub fn with_base_delay(self, base_delay_ms: u64) -> Result<Self, Error> {
        if base_delay_ms == 0 {
            return Err(Error::invalid_config(
                "base_retry_delay_ms cannot be 0",
                "base_retry_delay_ms",
            ));
        }
        if base_delay_ms > self.retry_delay.max_delay_ms() {
            return Err(Error::invalid_config(
                "base_retry_delay_ms cannot exceed max_retry_delay_ms",
                "base_retry_delay_ms",
            ));
        }
        Ok(Self {
            retry_delay: RetryDelay::new(base_delay_ms, self.retry_delay.max_delay_ms()),
            ..self
        })
    }

    pub fn with_max_delay(self, max_delay_ms: u64) -> Result<Self, Error> {
        if max_delay_ms < self.retry_delay.base_delay_ms() {
            return Err(Error::invalid_config(
                "max_retry_delay_ms cannot be lower than base_retry_delay_ms",
                "max_retry_delay_ms",
            ));
        }
        Ok(Self {
            retry_delay: RetryDelay::new(self.retry_delay.base_delay_ms(), max_delay_ms),
            ..self
        })
    }
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: RetryDelay::default(),
        }
    }
}

/// Settings for the subscription runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Deployment environment, used as topic and subscription prefix.
    environment: String,
    /// Deadline the broker waits for an ack before redelivering.
    ack_deadline: Duration,
    /// Pause after a failed receive before pulling again.
    receive_retry_interval: Duration,
    /// Deliveries handled concurrently per subscription.
    max_outstanding_messages: usize,
}

impl SubscriberConfig {
    pub fn new(environment: impl Into<String>) -> Result<Self, Error> {
        let environment = environment.into();
        if environment.trim().is_empty() {
            return Err(Error::invalid_config(
                "environment cannot be empty",
                "environment",
            ));
        }
        Ok(Self {
            environment,
            ack_deadline: Duration::from_secs(20),
            receive_retry_interval: Duration::from_secs(5),
            max_outstanding_messages: 10,
        })
    }

    /// Reads the environment from `GCP_PROJECT_ENV`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_environment(std::env::var(PROJECT_ENV_VAR).ok())
    }

    fn from_environment(environment: Option<String>) -> Result<Self, Error> {
        Self::new(environment.ok_or(Error::EnvironmentNotDefined)?)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }

    pub fn receive_retry_interval(&self) -> Duration {
        self.receive_retry_interval
    }

    pub fn max_outstanding_messages(&self) -> usize {
        self.max_outstanding_messages
    }

    pub fn with_ack_deadline(self, ack_deadline: Duration) -> Result<Self, Error> {
        if ack_deadline.is_zero() {
            return Err(Error::invalid_config(
                "ack_deadline cannot be 0",
                "ack_deadline",
            ));
        }
        Ok(Self {
            ack_deadline,
            ..self
        })
    }

    pub fn with_receive_retry_interval(self, interval: Duration) -> Self {
        Self {
            receive_retry_interval: interval,
            ..self
        }
    }

    pub fn with_max_outstanding_messages(self, max: usize) -> Result<Self, Error> {
        if max == 0 {
            return Err(Error::invalid_config(
                "max_outstanding_messages cannot be 0",
                "max_outstanding_messages",
            ));
        }
        Ok(Self {
            max_outstanding_messages: max,
            ..self
        })
    }
}

/// Connection settings for a remote event store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    target: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ConnectionSettings {
    pub fn builder() -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::default()
    }

    /// Reads the target from the given environment variable.
    pub fn from_env(var: &str) -> Result<Self, Error> {
        let target = std::env::var(var).map_err(|_| Error::InvalidConfig {
            message: format!("{var} not defined"),
            parameter: Some("target".to_string()),
        })?;
        Self::builder().target(target).build()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSettingsBuilder {
    target: Option<String>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl ConnectionSettingsBuilder {
    /// Endpoint URI, e.g. `http://event-source:65060`.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ConnectionSettings, Error> {
        let target = self
            .target
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::invalid_config("target is required", "target"))?;
        Ok(ConnectionSettings {
            target,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(2)),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(2)),
        })
    }
}
