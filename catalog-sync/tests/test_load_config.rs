use catalog_sync::load_config::{load_config, HttpMethod, DEFAULT_TOKEN_ENV};
use catalog_sync_core::validate::ValidationError;
use catalog_sync_core::source::{Encoding, SourceRecord};
use serde_json::json;
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

/// This test ensures a complete static config maps onto the engine and remote settings.
#[test]
#[serial]
fn test_load_config_full_file() {
    let file = config_file(
        r#"
input:
  path: ./data/prices.ndjson
  encoding: ndjson
  key_field: sku
  order_field: seq
  drop: [internal_note]
  require: [price]
engine:
  workers: 8
  requests_per_second: 25
  max_retries: 5
  checkpoint_path: ./state/prices.checkpoint.json
remote:
  url_template: "https://api.example.com/v1/products/{key}/price"
  method: PATCH
  backpressure_statuses: [429, 420]
  token_env: PRICES_TOKEN
output:
  dir: ./out
  spool: true
"#,
    );
    env::set_var("PRICES_TOKEN", "s3cret");

    let config = load_config(file.path()).expect("Config should load");
    env::remove_var("PRICES_TOKEN");

    assert_eq!(config.input.path, PathBuf::from("./data/prices.ndjson"));
    assert_eq!(config.input.encoding, Encoding::Ndjson);
    assert_eq!(config.input.key_field, "sku");
    assert_eq!(config.engine.workers, 8);
    assert_eq!(config.engine.requests_per_second, 25.0);
    assert_eq!(config.engine.max_retries, 5);
    assert_eq!(config.remote.method, HttpMethod::Patch);
    assert_eq!(config.remote.backpressure_statuses, vec![429, 420]);
    assert_eq!(config.token.as_deref(), Some("s3cret"));
    assert_eq!(config.output.dir, Some(PathBuf::from("./out")));

    let sync = config.synchronise_config().expect("maps onto engine config");
    assert_eq!(sync.input.validator.key_field(), "sku");
    assert_eq!(sync.input.options.encoding, Encoding::Ndjson);
    assert_eq!(
        sync.engine.checkpoint_path,
        Some(PathBuf::from("./state/prices.checkpoint.json"))
    );
    assert!(sync.spool);
}

/// Only `input.path` and `remote.url_template` are mandatory.
#[test]
#[serial]
fn test_load_config_applies_defaults() {
    let file = config_file(
        r#"
input:
  path: items.json
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    env::set_var(DEFAULT_TOKEN_ENV, "default-token");

    let config = load_config(file.path()).expect("Config should load");
    env::remove_var(DEFAULT_TOKEN_ENV);

    assert_eq!(config.input.key_field, "id");
    assert_eq!(config.input.encoding, Encoding::Auto);
    assert_eq!(config.remote.method, HttpMethod::Put);
    assert_eq!(config.remote.backpressure_statuses, vec![429]);
    assert_eq!(config.remote.token_env, DEFAULT_TOKEN_ENV);
    assert_eq!(config.engine, Default::default());
    assert_eq!(config.output.dir, None);
    assert_eq!(config.bearer_token().unwrap(), Some("default-token"));
}

#[test]
#[serial]
fn test_missing_token_is_an_error_unless_dry_run() {
    env::remove_var(DEFAULT_TOKEN_ENV);
    let live = config_file(
        r#"
input:
  path: items.json
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let config = load_config(live.path()).expect("loading does not need the token yet");
    assert!(config.token.is_none());
    let err = config.bearer_token().unwrap_err();
    assert!(err.to_string().contains(DEFAULT_TOKEN_ENV), "{err}");

    let dry = config_file(
        r#"
input:
  path: items.json
engine:
  dry_run: true
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let config = load_config(dry.path()).unwrap();
    assert_eq!(config.bearer_token().unwrap(), None);
}

#[test]
#[serial]
fn test_blank_token_counts_as_missing() {
    env::set_var(DEFAULT_TOKEN_ENV, "   ");
    let file = config_file(
        r#"
input:
  path: items.json
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let config = load_config(file.path()).unwrap();
    env::remove_var(DEFAULT_TOKEN_ENV);
    assert!(config.token.is_none());
}

#[test]
#[serial]
fn test_unknown_fields_are_rejected() {
    let file = config_file(
        r#"
input:
  path: items.json
remote:
  url_template: "https://api.example.com/items/{key}"
  api_token: "never in the file"
"#,
    );
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("parse"), "{err}");
}

#[test]
#[serial]
fn test_invalid_engine_values_are_rejected() {
    let file = config_file(
        r#"
input:
  path: items.json
engine:
  workers: 0
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let err = load_config(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("workers"), "{err:#}");
}

#[test]
#[serial]
fn test_keep_and_drop_together_are_rejected() {
    let file = config_file(
        r#"
input:
  path: items.json
  keep: [id, price]
  drop: [note]
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let config = load_config(file.path()).expect("projection is checked when mapping");
    let err = config.synchronise_config().unwrap_err();
    assert!(format!("{err:#}").contains("mutually exclusive"), "{err:#}");
}

#[test]
#[serial]
fn test_spool_requires_output_dir() {
    let file = config_file(
        r#"
input:
  path: items.json
remote:
  url_template: "https://api.example.com/items/{key}"
output:
  spool: true
"#,
    );
    let config = load_config(file.path()).unwrap();
    assert!(config.synchronise_config().is_err());
}

#[test]
#[serial]
fn test_missing_file_is_an_error() {
    let err = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"), "{err}");
}

/// `skip_if_missing` reaches the validator; `require` stays a source projection.
#[test]
#[serial]
fn test_skip_if_missing_configures_the_validator() {
    let file = config_file(
        r#"
input:
  path: items.json
  require: [id]
  skip_if_missing: [price]
engine:
  dry_run: true
remote:
  url_template: "https://api.example.com/items/{key}"
"#,
    );
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.input.skip_if_missing, vec!["price".to_string()]);
    let sync = config.synchronise_config().unwrap();

    let record = |offset: u64, value: serde_json::Value| SourceRecord {
        offset,
        fields: value.as_object().cloned().unwrap(),
    };
    let rejected = sync
        .input
        .validator
        .validate(record(0, json!({"id": "a"})))
        .unwrap_err();
    assert_eq!(rejected.error, ValidationError::MissingField("price".into()));
    assert!(sync
        .input
        .validator
        .validate(record(1, json!({"id": "b", "price": 3})))
        .is_ok());
}
