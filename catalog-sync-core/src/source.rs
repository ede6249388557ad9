//! # source: streaming record ingestion
//!
//! Turns an input file into a lazy, single-pass sequence of JSON object
//! records. Two physical encodings are supported:
//!
//! - a single array document (`[{...},{...}]`), scanned byte by byte so each
//!   element is yielded as soon as it closes, long before the final `]`;
//! - NDJSON, one object per non-empty line.
//!
//! Peak memory is the size of the largest single record. Records that fail
//! to parse, or that miss a `require`d field, are counted and skipped; they
//! never abort the stream. Only I/O errors do.
//!
//! Every raw element (or non-empty line) is assigned a zero-based offset,
//! whether it parses or not, so checkpoints can refer to input positions.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ConfigError, SourceError};

/// Fields starting with this prefix are engine metadata (written into
/// exports) and are stripped from every ingested record.
pub const RESERVED_PREFIX: &str = "_sync";

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Auto,
    JsonArray,
    Ndjson,
}

/// Field projection applied to each record. `keep` and `drop` are mutually
/// exclusive; `require` is checked against the record as read.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    keep: BTreeSet<String>,
    drop: BTreeSet<String>,
    require: Vec<String>,
}

impl Projection {
    pub fn new<I, S>(keep: I, drop: I, require: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keep: BTreeSet<String> = keep.into_iter().map(Into::into).collect();
        let drop: BTreeSet<String> = drop.into_iter().map(Into::into).collect();
        if !keep.is_empty() && !drop.is_empty() {
            return Err(ConfigError::KeepAndDrop);
        }
        Ok(Self {
            keep,
            drop,
            require: require.into_iter().map(Into::into).collect(),
        })
    }

    pub fn require<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            require: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Returns `None` when a required field is absent or null.
    pub fn apply(&self, mut record: Record) -> Option<Record> {
        record.retain(|k, _| !k.starts_with(RESERVED_PREFIX));
        let complete = self
            .require
            .iter()
            .all(|f| record.get(f).is_some_and(|v| !v.is_null()));
        if !complete {
            return None;
        }
        if !self.keep.is_empty() {
            record.retain(|k, _| self.keep.contains(k));
        } else if !self.drop.is_empty() {
            record.retain(|k, _| !self.drop.contains(k));
        }
        Some(record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub encoding: Encoding,
    pub projection: Projection,
    /// Skip every record at or before this offset without parsing it.
    pub resume_after: Option<u64>,
}

/// Counters describing what the source saw. `emitted` excludes dropped,
/// unparsable and resumed-past records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub emitted: u64,
    pub parse_errors: u64,
    pub dropped_missing_required: u64,
    pub resumed_past: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub offset: u64,
    pub fields: Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Element,
    Truncated,
    End,
}

/// Byte-level scanner for the elements of a top-level JSON array.
///
/// Tracks nesting depth, whether it is inside a string, and whether the
/// previous byte was an escaping backslash. Brackets, braces and commas inside
/// strings are therefore never structural.
#[derive(Debug, Default)]
struct ArrayScanner {
    depth: usize,
    in_string: bool,
    escape: bool,
    in_element: bool,
    closed: bool,
}

impl ArrayScanner {
    fn next_element<B: BufRead>(&mut self, reader: &mut B, out: &mut Vec<u8>) -> io::Result<Scan> {
        out.clear();
        if self.closed {
            return Ok(Scan::End);
        }
        loop {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                self.closed = true;
                if self.in_element {
                    self.in_element = false;
                    return Ok(Scan::Truncated);
                }
                return Ok(Scan::End);
            }
            let mut used = 0;
            let mut found = None;
            for &b in chunk {
                used += 1;
                if let Some(scan) = self.step(b, out) {
                    found = Some(scan);
                    break;
                }
            }
            reader.consume(used);
            if let Some(scan) = found {
                return Ok(scan);
            }
        }
    }

    fn step(&mut self, b: u8, out: &mut Vec<u8>) -> Option<Scan> {
        if !self.in_element {
            return match b {
                b' ' | b'\t' | b'\n' | b'\r' | b',' => None,
                b']' => {
                    self.closed = true;
                    Some(Scan::End)
                }
                _ => {
                    self.in_element = true;
                    self.escape = false;
                    self.in_string = b == b'"';
                    self.depth = usize::from(b == b'{' || b == b'[');
                    out.push(b);
                    None
                }
            };
        }

        if self.in_string {
            out.push(b);
            if self.escape {
                self.escape = false;
            } else if b == b'\\' {
                self.escape = true;
            } else if b == b'"' {
                self.in_string = false;
                if self.depth == 0 {
                    return self.finish();
                }
            }
            return None;
        }

        // Bare scalar element (number, true, false, null).
        if self.depth == 0 {
            return match b {
                b',' | b' ' | b'\t' | b'\n' | b'\r' => self.finish(),
                b']' => {
                    self.closed = true;
                    self.finish()
                }
                _ => {
                    out.push(b);
                    None
                }
            };
        }

        out.push(b);
        match b {
            b'"' => self.in_string = true,
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                self.depth -= 1;
                if self.depth == 0 {
                    return self.finish();
                }
            }
            _ => {}
        }
        None
    }

    fn finish(&mut self) -> Option<Scan> {
        self.in_element = false;
        Some(Scan::Element)
    }
}

#[derive(Debug)]
enum Mode {
    Array(ArrayScanner),
    Lines,
}

/// Lazy, forward-only record reader. See the module docs.
pub struct RecordSource<R: Read> {
    reader: BufReader<R>,
    mode: Option<Mode>,
    encoding: Encoding,
    projection: Projection,
    resume_after: Option<u64>,
    next_offset: u64,
    buf: Vec<u8>,
    stats: SourceStats,
}

impl RecordSource<File> {
    pub fn open<P: AsRef<Path>>(path: P, options: SourceOptions) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), encoding = ?options.encoding, "Opened input for streaming");
        Ok(Self::new(file, options))
    }
}

impl<R: Read> RecordSource<R> {
    pub fn new(reader: R, options: SourceOptions) -> Self {
        Self {
            reader: BufReader::new(reader),
            mode: None,
            encoding: options.encoding,
            projection: options.projection,
            resume_after: options.resume_after,
            next_offset: 0,
            buf: Vec::new(),
            stats: SourceStats::default(),
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Offset that the next raw record will receive; after the end of the
    /// stream this is the total number of raw records.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Yields the next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        if self.mode.is_none() {
            self.mode = Some(self.detect()?);
        }
        loop {
            let truncated = match self.next_raw()? {
                None => return Ok(None),
                Some(truncated) => truncated,
            };
            let offset = self.next_offset;
            self.next_offset += 1;

            if self.resume_after.is_some_and(|r| offset <= r) {
                self.stats.resumed_past += 1;
                continue;
            }
            if truncated {
                warn!(offset, "Input ended inside a record; skipping it");
                self.stats.parse_errors += 1;
                continue;
            }

            match serde_json::from_slice::<Value>(&self.buf) {
                Ok(Value::Object(fields)) => match self.projection.apply(fields) {
                    Some(fields) => {
                        self.stats.emitted += 1;
                        return Ok(Some(SourceRecord { offset, fields }));
                    }
                    None => {
                        debug!(offset, "Record is missing a required field; dropped");
                        self.stats.dropped_missing_required += 1;
                    }
                },
                Ok(other) => {
                    warn!(offset, kind = value_kind(&other), "Record is not a JSON object; skipping");
                    self.stats.parse_errors += 1;
                }
                Err(e) => {
                    warn!(offset, error = %e, "Failed to parse record; skipping");
                    self.stats.parse_errors += 1;
                }
            }
        }
    }

    fn detect(&mut self) -> Result<Mode, SourceError> {
        let first = loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                break None;
            }
            if buf.starts_with(&[0xEF, 0xBB, 0xBF]) {
                self.reader.consume(3);
                continue;
            }
            let ws = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if ws < buf.len() {
                let first = buf[ws];
                self.reader.consume(ws);
                break Some(first);
            }
            self.reader.consume(ws);
        };

        let array = match self.encoding {
            Encoding::Auto => first == Some(b'['),
            Encoding::JsonArray => {
                if first.is_some() && first != Some(b'[') {
                    return Err(SourceError::NotAnArray);
                }
                true
            }
            Encoding::Ndjson => false,
        };
        if array {
            if first == Some(b'[') {
                self.reader.consume(1);
            }
            debug!("Streaming input as a JSON array document");
            Ok(Mode::Array(ArrayScanner::default()))
        } else {
            debug!("Streaming input as newline-delimited JSON");
            Ok(Mode::Lines)
        }
    }

    /// Fills `self.buf` with the next raw record. Returns `Some(true)` when
    /// the input ended inside an array element.
    fn next_raw(&mut self) -> Result<Option<bool>, SourceError> {
        match self.mode.as_mut() {
            Some(Mode::Array(scanner)) => match scanner.next_element(&mut self.reader, &mut self.buf)? {
                Scan::Element => Ok(Some(false)),
                Scan::Truncated => Ok(Some(true)),
                Scan::End => Ok(None),
            },
            Some(Mode::Lines) | None => loop {
                self.buf.clear();
                if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
                    return Ok(None);
                }
                let end = self
                    .buf
                    .iter()
                    .rposition(|b| !b.is_ascii_whitespace())
                    .map_or(0, |i| i + 1);
                self.buf.truncate(end);
                if !self.buf.is_empty() {
                    return Ok(Some(false));
                }
            },
        }
    }
}

impl<R: Read> Iterator for RecordSource<R> {
    type Item = Result<SourceRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
