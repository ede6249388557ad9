use std::io::{self, Read};

use catalog_sync_core::error::{ConfigError, SourceError};
use catalog_sync_core::source::{Encoding, Projection, RecordSource, SourceOptions};
use serde_json::{json, Value};

fn collect(input: &str, options: SourceOptions) -> (Vec<(u64, Value)>, RecordSource<&[u8]>) {
    let mut source = RecordSource::new(input.as_bytes(), options);
    let mut out = Vec::new();
    while let Some(record) = source.next_record().unwrap() {
        out.push((record.offset, Value::Object(record.fields)));
    }
    (out, source)
}

/// Serves the input in tiny chunks and fails if read past `limit` bytes.
struct Trickle<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
}

impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, "read past the first element"));
        }
        let end = (self.pos + 3).min(self.data.len()).min(self.limit);
        let n = (end - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[test]
fn streamed_array_matches_whole_document_parse() {
    let doc = r#"[
        {"id": 1, "name": "brackets ] [ and braces } {", "tags": ["a", "b,c"]},
        {"id": 2, "nested": {"deep": {"deeper": [[1, 2], {"x": "y"}]}}},
        {"id": 3, "quote": "she said \"hi\", then left", "path": "C:\\temp\\"},
        {"id": 4, "unicode": "caf\u00e9 \u2603", "empty": {}, "list": []}
    ]"#;
    let expected: Vec<Value> = serde_json::from_str(doc).unwrap();

    let (records, source) = collect(doc, SourceOptions::default());
    let values: Vec<Value> = records.into_iter().map(|(_, v)| v).collect();

    assert_eq!(values, expected);
    assert_eq!(source.stats().parse_errors, 0);
    assert_eq!(source.stats().emitted, 4);
}

#[test]
fn first_element_is_yielded_before_the_rest_is_read() {
    let doc = br#"[{"id": "first", "note": "]"}, {"id": "second"}]"#;
    let first_end = doc.iter().position(|&b| b == b'}').unwrap() + 1;
    let reader = Trickle {
        data: doc,
        pos: 0,
        limit: first_end,
    };
    let mut source = RecordSource::new(reader, SourceOptions::default());

    let first = source.next_record().unwrap().unwrap();
    assert_eq!(first.fields["id"], "first");
}

#[test]
fn truncated_array_counts_one_parse_error() {
    let (records, source) = collect(r#"[{"id": 1}, {"id": 2}, {"id": "#, SourceOptions::default());
    assert_eq!(records.len(), 2);
    assert_eq!(source.stats().parse_errors, 1);
    assert_eq!(source.next_offset(), 3);
}

#[test]
fn non_object_elements_are_parse_errors() {
    let (records, source) = collect(r#"[{"id": 1}, 42, "text", null, {"id": 2}]"#, SourceOptions::default());
    let offsets: Vec<u64> = records.iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![0, 4]);
    assert_eq!(source.stats().parse_errors, 3);
}

#[test]
fn require_keeps_complete_records() {
    let options = SourceOptions {
        projection: Projection::require(["id"]),
        ..SourceOptions::default()
    };
    let (records, source) = collect(r#"[{"id":1},{"id":2},{"id":3}]"#, options);
    assert_eq!(records.len(), 3);
    assert_eq!(source.stats().dropped_missing_required, 0);
}

#[test]
fn require_drops_incomplete_records() {
    let options = SourceOptions {
        projection: Projection::require(["id", "price"]),
        ..SourceOptions::default()
    };
    let input = "{\"id\":1,\"price\":3}\n{\"id\":2}\n{\"id\":3,\"price\":null}\n";
    let (records, source) = collect(input, options);
    assert_eq!(records, vec![(0, json!({"id": 1, "price": 3}))]);
    assert_eq!(source.stats().dropped_missing_required, 2);
}

#[test]
fn ndjson_skips_bad_lines_and_blank_lines() {
    let input = "{\"id\":1}\nnot json\n\n   \n[1]\r\n{\"id\":2}\r\n";
    let (records, source) = collect(input, SourceOptions::default());
    assert_eq!(records, vec![(0, json!({"id": 1})), (3, json!({"id": 2}))]);
    assert_eq!(source.stats().parse_errors, 2);
    assert_eq!(source.next_offset(), 4);
}

#[test]
fn keep_and_drop_are_mutually_exclusive() {
    let err = Projection::new(vec!["a"], vec!["b"], vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::KeepAndDrop));
}

#[test]
fn projection_applies_keep_and_strips_reserved_fields() {
    let options = SourceOptions {
        projection: Projection::new(vec!["id", "price"], vec![], vec![]).unwrap(),
        ..SourceOptions::default()
    };
    let input = r#"{"id": 7, "price": 1, "colour": "red", "_sync": {"outcome": "failed"}}"#;
    let (records, _) = collect(input, options);
    assert_eq!(records, vec![(0, json!({"id": 7, "price": 1}))]);

    let options = SourceOptions {
        projection: Projection::new(vec![], vec!["colour"], vec![]).unwrap(),
        ..SourceOptions::default()
    };
    let (records, _) = collect(input, options);
    assert_eq!(records, vec![(0, json!({"id": 7, "price": 1}))]);
}

#[test]
fn resume_skips_records_at_or_before_offset() {
    let input = "{\"id\":0}\n{\"id\":1}\nbroken\n{\"id\":3}\n{\"id\":4}\n";
    let options = SourceOptions {
        resume_after: Some(2),
        ..SourceOptions::default()
    };
    let (records, source) = collect(input, options);
    let offsets: Vec<u64> = records.iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![3, 4]);
    assert_eq!(source.stats().resumed_past, 3);
    assert_eq!(source.stats().parse_errors, 0, "skipped records are not parsed");
}

#[test]
fn declared_array_without_bracket_is_rejected() {
    let options = SourceOptions {
        encoding: Encoding::JsonArray,
        ..SourceOptions::default()
    };
    let mut source = RecordSource::new("{\"id\":1}\n".as_bytes(), options);
    assert!(matches!(source.next_record(), Err(SourceError::NotAnArray)));
}

#[test]
fn byte_order_mark_does_not_hide_array() {
    let input = "\u{feff}  [{\"id\": \"x\"}]";
    let (records, _) = collect(input, SourceOptions::default());
    assert_eq!(records, vec![(0, json!({"id": "x"}))]);
}

#[test]
fn empty_input_yields_nothing() {
    let (records, source) = collect("", SourceOptions::default());
    assert!(records.is_empty());
    assert_eq!(source.stats(), Default::default());
}

#[test]
fn iterator_adapter_yields_records() {
    let source = RecordSource::new("{\"id\":1}\n{\"id\":2}\n".as_bytes(), SourceOptions::default());
    let ids: Vec<Value> = source.map(|r| r.unwrap().fields["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}
