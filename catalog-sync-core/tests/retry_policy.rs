use std::time::Duration;

use async_trait::async_trait;
use catalog_sync_core::contract::{
    MockRemoteCall, Operation, OperationKey, RemoteCall, RemoteOutcome, RemoteStatus,
};
use catalog_sync_core::config::{seconds, EngineConfig};
use catalog_sync_core::rate_limit::RateLimiter;
use catalog_sync_core::result::ItemOutcome;
use catalog_sync_core::retry::{Decision, RetryController, RetryPolicy};
use catalog_sync_core::source::SourceRecord;
use catalog_sync_core::validate::{ValidationError, Validator};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        backoff_factor: 2.0,
        max_delay: Duration::from_secs(5),
    }
}

#[test]
fn backoff_grows_exponentially_and_caps() {
    let p = policy();
    assert_eq!(p.backoff(0), Duration::from_secs(1));
    assert_eq!(p.backoff(1), Duration::from_secs(2));
    assert_eq!(p.backoff(2), Duration::from_secs(4));
    assert_eq!(p.backoff(3), Duration::from_secs(5));
    assert_eq!(p.backoff(200), Duration::from_secs(5));
}

#[test]
fn extreme_timings_are_rejected_or_saturate() {
    let slow = EngineConfig {
        requests_per_second: 1e-20,
        ..EngineConfig::default()
    };
    let err = slow.validate().unwrap_err();
    assert!(err.to_string().contains("requests_per_second"), "{err}");

    let huge_delay = EngineConfig {
        max_delay_seconds: 1e30,
        ..EngineConfig::default()
    };
    let err = huge_delay.validate().unwrap_err();
    assert!(err.to_string().contains("max_delay_seconds"), "{err}");

    let huge_run = EngineConfig {
        run_timeout_seconds: Some(1e300),
        ..EngineConfig::default()
    };
    assert!(huge_run.validate().is_err());

    // Unvalidated values still convert without panicking.
    let p = RetryPolicy::from_config(&huge_delay);
    assert_eq!(p.max_delay, Duration::MAX);
    assert_eq!(huge_run.run_timeout(), Some(Duration::MAX));
    assert_eq!(seconds(-1.0), Duration::ZERO);
    assert_eq!(seconds(f64::NAN), Duration::ZERO);
    assert_eq!(seconds(1.5), Duration::from_millis(1500));
}

#[test]
fn decisions_follow_classification() {
    let p = policy();
    assert_eq!(p.decide(&RemoteOutcome::success(), 0), Decision::Succeeded);
    assert_eq!(p.decide(&RemoteOutcome::permanent(400, "bad"), 0), Decision::Failed);
    assert_eq!(
        p.decide(&RemoteOutcome::transient("503"), 1),
        Decision::Retrying(Duration::from_secs(2))
    );
    assert_eq!(
        p.decide(&RemoteOutcome::rate_limited(), 0),
        Decision::Retrying(Duration::from_secs(1))
    );
}

#[test]
fn retry_budget_is_shared_between_kinds() {
    let p = policy();
    assert_eq!(p.decide(&RemoteOutcome::rate_limited(), 3), Decision::Failed);
    assert_eq!(p.decide(&RemoteOutcome::transient("timeout"), 3), Decision::Failed);
}

#[test]
fn retry_after_wins_when_longer_but_stays_capped() {
    let p = policy();
    let outcome = RemoteOutcome::rate_limited().with_retry_after(Duration::from_secs(3));
    assert_eq!(p.decide(&outcome, 0), Decision::Retrying(Duration::from_secs(3)));

    let outcome = RemoteOutcome::rate_limited().with_retry_after(Duration::from_millis(10));
    assert_eq!(p.decide(&outcome, 1), Decision::Retrying(Duration::from_secs(2)));

    let outcome = RemoteOutcome::rate_limited().with_retry_after(Duration::from_secs(120));
    assert_eq!(p.decide(&outcome, 0), Decision::Retrying(Duration::from_secs(5)));
}

struct Slow;

#[async_trait]
impl RemoteCall for Slow {
    async fn call(&self, _op: &Operation) -> RemoteOutcome {
        tokio::time::sleep(Duration::from_secs(10)).await;
        RemoteOutcome::success()
    }
}

#[tokio::test(start_paused = true)]
async fn slow_call_times_out_as_transient() {
    let mut session = MockRemoteCall::new();
    session.expect_call().times(2).returning(|_| RemoteOutcome::success());

    let limiter = RateLimiter::new(100.0, 1);
    let cancel = CancellationToken::new();
    let p = RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(100),
        ..policy()
    };
    let controller = RetryController {
        policy: &p,
        limiter: &limiter,
        call_timeout: Duration::from_secs(1),
        dry_run: false,
        cancel: &cancel,
    };

    let result = controller.execute(&Slow, Operation::new("slow", json!({}))).await;
    assert_eq!(result.outcome, ItemOutcome::Failed);
    assert_eq!(result.attempts, 2);
    let last = result.last_outcome.unwrap();
    assert_eq!(last.status, RemoteStatus::TransientFailure);
    assert!(last.message.unwrap().starts_with("call timed out after"));

    let ok = controller.execute(&session, Operation::new("fast", json!({}))).await;
    assert_eq!(ok.outcome, ItemOutcome::Succeeded);
    assert!(!ok.interrupted);
    let ok = controller.execute(&session, Operation::new(7i64, json!({}))).await;
    assert_eq!(ok.key, Some(OperationKey::Int(7)));
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_fails_with_last_outcome() {
    let mut session = MockRemoteCall::new();
    session
        .expect_call()
        .times(1)
        .returning(|_| RemoteOutcome::transient("502"));
    let limiter = RateLimiter::new(100.0, 1);
    let cancel = CancellationToken::new();
    let p = policy();
    let controller = RetryController {
        policy: &p,
        limiter: &limiter,
        call_timeout: Duration::from_secs(30),
        dry_run: false,
        cancel: &cancel,
    };

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };
    let result = controller.execute(&session, Operation::new("k", json!({}))).await;
    canceller.await.unwrap();

    assert_eq!(result.outcome, ItemOutcome::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.reason.as_deref(), Some("run cancelled before retry"));
    assert!(result.interrupted, "the operation must stay pending for the checkpoint");
    assert_eq!(result.last_outcome.unwrap().message.as_deref(), Some("502"));
}

fn record(offset: u64, fields: Value) -> SourceRecord {
    match fields {
        Value::Object(fields) => SourceRecord { offset, fields },
        _ => panic!("test records must be objects"),
    }
}

#[test]
fn validator_builds_operations_from_records() {
    let validator = Validator::new("sku").with_order_field(Some("seq".into()));
    let op = validator
        .validate(record(4, json!({"sku": "A-1", "seq": 9, "price": 3})))
        .unwrap();
    assert_eq!(op.key, OperationKey::from("A-1"));
    assert_eq!(op.order_hint, Some(9));
    assert_eq!(op.offset, 4);
    assert_eq!(op.payload["price"], 3);

    let op = validator.validate(record(5, json!({"sku": 12}))).unwrap();
    assert_eq!(op.key, OperationKey::Int(12));
    assert_eq!(op.order_hint, None);
}

#[test]
fn validator_rejects_without_failing() {
    let validator = Validator::default().with_required(["price"]);

    let rejected = validator.validate(record(0, json!({"price": 1}))).unwrap_err();
    assert_eq!(rejected.error, ValidationError::MissingKey("id".into()));

    let rejected = validator.validate(record(1, json!({"id": "", "price": 1}))).unwrap_err();
    assert!(matches!(rejected.error, ValidationError::InvalidKey { .. }));

    let rejected = validator.validate(record(2, json!({"id": "x", "price": null}))).unwrap_err();
    assert_eq!(rejected.error, ValidationError::MissingField("price".into()));
    assert_eq!(rejected.offset, 2);
    assert_eq!(rejected.record["id"], "x");

    let ordered = Validator::default().with_order_field(Some("seq".into()));
    let rejected = ordered.validate(record(3, json!({"id": 1, "seq": "soon"}))).unwrap_err();
    assert_eq!(rejected.error, ValidationError::InvalidOrderHint("seq".into()));
}
