//! # contract: boundary types between the engine and its collaborators
//!
//! The engine never builds requests and never looks inside business payloads.
//! Everything it needs from the outside world crosses this module:
//!
//! - [`Operation`]: one "apply this change to a remote resource" unit, produced
//!   from an input record.
//! - [`RemoteCall`]: performs one operation and classifies the result as a
//!   [`RemoteOutcome`]. Implemented by the CLI's HTTP client, by test stubs and
//!   by `mockall` mocks.
//! - [`SessionFactory`]: opens one [`RemoteCall`] session per worker, so each
//!   worker keeps its own connection.
//!
//! ## Mocking & Testing
//! Both traits are annotated for `mockall`; the mocks are exported under the
//! `test-export-mocks` feature so integration tests in other crates can use them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the remote resource an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationKey {
    Int(i64),
    Str(String),
}

impl OperationKey {
    /// Reads a key out of a JSON value. Only strings and integers qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(OperationKey::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(OperationKey::Int),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKey::Int(i) => write!(f, "{i}"),
            OperationKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for OperationKey {
    fn from(s: &str) -> Self {
        OperationKey::Str(s.to_string())
    }
}

impl From<i64> for OperationKey {
    fn from(i: i64) -> Self {
        OperationKey::Int(i)
    }
}

/// One unit of work. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub key: OperationKey,
    /// The full input record. Opaque to the engine.
    pub payload: Value,
    pub order_hint: Option<i64>,
    /// Position of the originating record in the input stream.
    pub offset: u64,
}

impl Operation {
    pub fn new(key: impl Into<OperationKey>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
            order_hint: None,
            offset: 0,
        }
    }
}

/// Classification of a single remote-call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Success,
    RateLimited,
    TransientFailure,
    PermanentFailure,
}

/// Result of one remote-call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub status: RemoteStatus,
    pub status_code: Option<u16>,
    pub message: Option<String>,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    /// Server-advertised delay before the next attempt, when it sent one.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_millis")]
    pub retry_after: Option<Duration>,
}

impl RemoteOutcome {
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            status_code: None,
            message: None,
            latency: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn success() -> Self {
        Self::new(RemoteStatus::Success)
    }

    pub fn rate_limited() -> Self {
        Self::new(RemoteStatus::RateLimited).with_code(429)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::TransientFailure).with_message(message)
    }

    pub fn permanent(code: u16, message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::PermanentFailure)
            .with_code(code)
            .with_message(message)
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RemoteStatus::Success
    }
}

/// Error raised when a worker session cannot be opened. Fatal for the run.
pub type SessionError = Box<dyn std::error::Error + Send + Sync>;

/// Performs one operation against the remote system.
///
/// Implementations must classify every failure into a [`RemoteOutcome`];
/// they never return errors. Calls must be safe to repeat for the same key.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, op: &Operation) -> RemoteOutcome;
}

#[async_trait]
impl<R: RemoteCall + ?Sized> RemoteCall for Arc<R> {
    async fn call(&self, op: &Operation) -> RemoteOutcome {
        (**self).call(op).await
    }
}

/// Opens one remote session per worker.
///
/// A session is owned by exactly one worker for the whole run; implementors
/// typically put a dedicated HTTP client (and its keep-alive pool) in each.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, worker_id: usize) -> Result<Box<dyn RemoteCall>, SessionError>;
}

/// Hands the same remote-call implementation to every worker.
///
/// Useful for stubs that count calls across the whole pool.
pub struct SharedSession<R> {
    inner: Arc<R>,
}

impl<R> SharedSession<R> {
    pub fn new(inner: Arc<R>) -> Self {
        Self { inner }
    }
}

impl<R: RemoteCall + 'static> SessionFactory for SharedSession<R> {
    fn open_session(&self, _worker_id: usize) -> Result<Box<dyn RemoteCall>, SessionError> {
        Ok(Box::new(self.inner.clone()))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
