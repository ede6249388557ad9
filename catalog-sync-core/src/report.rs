//! # report: run exports and summary
//!
//! Once the pool has drained, the emitter writes into the output directory:
//!
//! - `succeeded.ndjson`, `failed.ndjson`, `skipped.ndjson`: one line per
//!   item, the original record plus a `_sync` object describing the outcome.
//!   The source strips `_sync` on ingest, so `failed.ndjson` can be fed back
//!   in as the input of a new run.
//! - `summary.md`: human-readable counts, rates and timing.
//! - `summary.json`: the same [`RunSummary`] as JSON.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::aggregate::ResultAggregator;
use crate::error::ReportError;
use crate::result::{ItemResult, RunStats};
use crate::source::{SourceStats, RESERVED_PREFIX};

pub const SUCCEEDED_FILE: &str = "succeeded.ndjson";
pub const FAILED_FILE: &str = "failed.ndjson";
pub const SKIPPED_FILE: &str = "skipped.ndjson";
pub const SUMMARY_FILE: &str = "summary.md";
pub const SUMMARY_JSON_FILE: &str = "summary.json";

/// Builds the export line for one result: the original record with the
/// outcome metadata under the reserved `_sync` field.
pub fn export_entry(result: &ItemResult) -> Value {
    let last = result.last_outcome.as_ref();
    let meta = json!({
        "outcome": result.outcome,
        "key": result.key,
        "offset": result.offset,
        "retry_count": result.retry_count,
        "attempts": result.attempts,
        "status": last.map(|o| o.status),
        "status_code": last.and_then(|o| o.status_code),
        "message": last.and_then(|o| o.message.clone()),
        "latency_ms": last.map(|o| o.latency.as_millis() as u64),
        "reason": result.reason,
        "first_attempt": result.first_attempt,
        "last_attempt": result.last_attempt,
    });
    let mut record = match &result.payload {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("payload".to_string(), other.clone());
            map
        }
    };
    record.insert(RESERVED_PREFIX.to_string(), meta);
    Value::Object(record)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub succeeded: PathBuf,
    pub failed: PathBuf,
    pub skipped: PathBuf,
    pub summary: PathBuf,
}

impl Artifacts {
    fn in_dir(dir: &Path) -> Self {
        Self {
            succeeded: dir.join(SUCCEEDED_FILE),
            failed: dir.join(FAILED_FILE),
            skipped: dir.join(SKIPPED_FILE),
            summary: dir.join(SUMMARY_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub stats: RunStats,
    pub source: SourceStats,
    pub success_rate: f64,
    pub duration_secs: f64,
    pub throughput: f64,
    pub checkpoint_offset: Option<u64>,
    pub artifacts: Option<Artifacts>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, stats: RunStats, source: SourceStats, checkpoint_offset: Option<u64>) -> Self {
        Self {
            run_id,
            success_rate: stats.success_rate(),
            duration_secs: stats.duration_secs(),
            throughput: stats.throughput(),
            stats,
            source,
            checkpoint_offset,
            artifacts: None,
        }
    }

    pub fn to_markdown(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        out.push_str("# Sync run summary\n\n");
        out.push_str(&format!("Run: `{}`\n\n", self.run_id));
        if s.cancelled {
            out.push_str("**The run was cancelled before the input was exhausted.**\n\n");
        }
        out.push_str("| Metric | Value |\n|---|---|\n");
        let rows: [(&str, String); 12] = [
            ("Total", s.attempted.to_string()),
            ("Succeeded", s.succeeded.to_string()),
            ("Failed", s.failed.to_string()),
            ("Skipped", s.skipped.to_string()),
            ("Retried", s.retried.to_string()),
            ("Remote calls", s.remote_calls.to_string()),
            ("Success rate", format!("{:.2}%", self.success_rate)),
            ("Duration", format!("{:.1}s", self.duration_secs)),
            ("Throughput", format!("{:.2} items/s", self.throughput)),
            ("Parse errors", self.source.parse_errors.to_string()),
            ("Dropped (missing required)", self.source.dropped_missing_required.to_string()),
            ("Resumed past", self.source.resumed_past.to_string()),
        ];
        for (name, value) in rows {
            out.push_str(&format!("| {name} | {value} |\n"));
        }
        if let Some(offset) = self.checkpoint_offset {
            out.push_str(&format!("\nCheckpoint at input offset {offset}.\n"));
        }
        out
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_ndjson<'a>(
    path: &Path,
    results: impl Iterator<Item = &'a ItemResult>,
    append: bool,
) -> Result<(), ReportError> {
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    };
    let mut writer = BufWriter::new(file.map_err(io_err(path))?);
    // Interrupted operations are redone by the next run.
    for result in results.filter(|r| !r.interrupted) {
        serde_json::to_writer(&mut writer, &export_entry(result))?;
        writer.write_all(b"\n").map_err(io_err(path))?;
    }
    writer.flush().map_err(io_err(path))
}

pub struct ReportEmitter {
    dir: PathBuf,
    append: bool,
}

impl ReportEmitter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append: false,
        }
    }

    /// Appends to existing item exports instead of replacing them. Used when
    /// a run resumes from a checkpoint. The summaries are always rewritten.
    pub fn appending(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Writes every artifact and fills in `summary.artifacts`.
    pub fn emit(&self, aggregator: &ResultAggregator, summary: &mut RunSummary) -> Result<(), ReportError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let artifacts = Artifacts::in_dir(&self.dir);

        if aggregator.is_spooled() {
            aggregator.flush()?;
        } else {
            aggregator
                .with_results(|buckets| -> Result<(), ReportError> {
                    write_ndjson(&artifacts.succeeded, buckets.succeeded.iter(), self.append)?;
                    write_ndjson(&artifacts.failed, buckets.failed.iter(), self.append)?;
                    write_ndjson(&artifacts.skipped, buckets.skipped.iter(), self.append)
                })
                .unwrap_or(Ok(()))?;
        }

        summary.artifacts = Some(artifacts.clone());
        fs::write(&artifacts.summary, summary.to_markdown()).map_err(io_err(&artifacts.summary))?;
        let json_path = self.dir.join(SUMMARY_JSON_FILE);
        fs::write(&json_path, serde_json::to_vec_pretty(summary)?).map_err(io_err(&json_path))?;

        info!(
            dir = %self.dir.display(),
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            skipped = summary.stats.skipped,
            "Wrote run reports"
        );
        Ok(())
    }
}
