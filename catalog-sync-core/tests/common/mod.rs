#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use catalog_sync_core::config::EngineConfig;
use catalog_sync_core::contract::{Operation, RemoteCall, RemoteOutcome, SharedSession};
use catalog_sync_core::synchronise::{synchronise, InputSpec, SynchroniseConfig, SynchroniseReport};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Remote stub that replays scripted outcomes per key and succeeds otherwise.
#[derive(Default)]
pub struct ScriptedRemote {
    scripts: Mutex<HashMap<String, VecDeque<RemoteOutcome>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    cancel_after: Option<(usize, CancellationToken)>,
    count: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, key: &str, outcomes: Vec<RemoteOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), outcomes.into());
        self
    }

    /// Cancels `token` once `calls` calls have been made, simulating a crash.
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }
}

#[async_trait]
impl RemoteCall for ScriptedRemote {
    async fn call(&self, op: &Operation) -> RemoteOutcome {
        let key = op.key.to_string();
        self.calls.lock().unwrap().push((key.clone(), Instant::now()));
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if n >= *limit {
                token.cancel();
            }
        }
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(RemoteOutcome::success)
    }
}

pub fn write_ndjson(dir: &Path, name: &str, records: &[Value]) -> PathBuf {
    let path = dir.join(name);
    let body: String = records.iter().map(|r| format!("{r}\n")).collect();
    std::fs::write(&path, body).unwrap();
    path
}

pub fn keyed_records(keys: &[&str]) -> Vec<Value> {
    keys.iter()
        .map(|k| serde_json::json!({ "id": k, "price": 10 }))
        .collect()
}

pub fn engine(workers: usize, requests_per_second: f64) -> EngineConfig {
    EngineConfig {
        workers,
        requests_per_second,
        ..EngineConfig::default()
    }
}

pub fn sync_config(input: &Path, engine: EngineConfig) -> SynchroniseConfig {
    SynchroniseConfig::new(InputSpec::new(input), engine)
}

pub async fn run_with(
    config: &SynchroniseConfig,
    remote: Arc<ScriptedRemote>,
    cancel: CancellationToken,
) -> SynchroniseReport {
    synchronise(config, &SharedSession::new(remote), cancel)
        .await
        .expect("run should complete")
}

pub async fn run(config: &SynchroniseConfig, remote: Arc<ScriptedRemote>) -> SynchroniseReport {
    run_with(config, remote, CancellationToken::new()).await
}
