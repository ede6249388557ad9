//! Terminal per-item results and aggregate run counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{Operation, OperationKey, RemoteOutcome};
use crate::validate::Rejected;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Final outcome for one operation (or one rejected record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub outcome: ItemOutcome,
    /// Absent only for records rejected before a key could be read.
    pub key: Option<OperationKey>,
    pub offset: u64,
    /// The original record, so failures can be re-run standalone.
    pub payload: Value,
    pub retry_count: u32,
    pub attempts: u32,
    pub first_attempt: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_outcome: Option<RemoteOutcome>,
    /// Why the item was skipped, or why it stopped early.
    pub reason: Option<String>,
    /// Cut short by cancellation. Its offset stays pending, so a resumed
    /// run processes the operation again.
    #[serde(default)]
    pub interrupted: bool,
}

impl ItemResult {
    pub fn attempted(
        outcome: ItemOutcome,
        op: Operation,
        attempts: u32,
        first_attempt: DateTime<Utc>,
        last_attempt: DateTime<Utc>,
        last_outcome: RemoteOutcome,
    ) -> Self {
        Self {
            outcome,
            key: Some(op.key),
            offset: op.offset,
            payload: op.payload,
            retry_count: attempts.saturating_sub(1),
            attempts,
            first_attempt: Some(first_attempt),
            last_attempt: Some(last_attempt),
            last_outcome: Some(last_outcome),
            reason: None,
            interrupted: false,
        }
    }

    pub fn skipped(rejected: Rejected, key_field: &str) -> Self {
        let key = rejected.record.get(key_field).and_then(OperationKey::from_value);
        Self {
            outcome: ItemOutcome::Skipped,
            key,
            offset: rejected.offset,
            payload: Value::Object(rejected.record),
            retry_count: 0,
            attempts: 0,
            first_attempt: None,
            last_attempt: None,
            last_outcome: None,
            reason: Some(rejected.error.to_string()),
            interrupted: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }
}

/// Counter snapshot for a run. `attempted == succeeded + failed + skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Operations that needed at least one retry.
    pub retried: u64,
    pub remote_calls: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl RunStats {
    pub fn duration_secs(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Share of attempted items that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.attempted as f64
    }

    /// Terminal results per second of wall clock.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration_secs();
        if secs <= 0.0 {
            return self.attempted as f64;
        }
        self.attempted as f64 / secs
    }
}
