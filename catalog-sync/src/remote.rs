#![doc = "HTTP remote for the CLI: performs one operation per request and classifies the response for the engine."]
//
//! # HTTP Remote (CLI <-> Core)
//!
//! This module implements the core's [`SessionFactory`] and [`RemoteCall`] contract against a
//! JSON HTTP API described by the `remote` section of the config file.
//!
//! - Every worker session owns its own `reqwest::Client`, so each keeps its own keep-alive pool.
//! - The request URL is the configured template with the `{key}` path segment replaced by the
//!   key, percent-encoded as a single path segment.
//! - An `Idempotency-Key` header (SHA-256 of key and payload) lets the service discard repeats.
//!
//! ## Classification
//!
//! | Response | Outcome |
//! |---|---|
//! | 2xx | `Success` |
//! | configured backpressure status (default 429) | `RateLimited`, honouring `Retry-After` (seconds or HTTP date) |
//! | 408, 5xx, timeouts, connection errors | `TransientFailure` |
//! | any other status, request build errors | `PermanentFailure` |

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use catalog_sync_core::contract::{
    Operation, OperationKey, RemoteCall, RemoteOutcome, RemoteStatus, SessionError, SessionFactory,
};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Response, Url};
use sha2::{Digest, Sha256};

use crate::load_config::{HttpMethod, RemoteSection};

/// Upper bound on how much of an error body is kept as the outcome message.
const MAX_MESSAGE_BYTES: usize = 512;
const KEY_PLACEHOLDER: &str = "{key}";
/// Stands in for the placeholder while the template is parsed; `{` and `}`
/// would otherwise be percent-encoded by the URL parser.
const KEY_MARKER: &str = "catalog-sync-key-marker";

/// A parsed `remote.url_template`.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlTemplate {
    base: Url,
}

impl UrlTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        if !template.contains(KEY_PLACEHOLDER) {
            return Err(anyhow!("remote.url_template must contain {KEY_PLACEHOLDER}: {template}"));
        }
        let base = Url::parse(&template.replace(KEY_PLACEHOLDER, KEY_MARKER))
            .map_err(|e| anyhow!("remote.url_template is not a valid URL: {e}"))?;
        if base.cannot_be_a_base() || !base.path().contains(KEY_MARKER) {
            return Err(anyhow!(
                "remote.url_template must have {KEY_PLACEHOLDER} in its path: {template}"
            ));
        }
        Ok(Self { base })
    }

    /// The request URL for `key`. The key is encoded as one path segment,
    /// so `/` and `?` inside it never change the route. `.` and `..` have
    /// no encoding that URL parsers leave alone, so they are refused.
    pub fn render(&self, key: &OperationKey) -> Result<Url> {
        let raw = key.to_string();
        if raw.is_empty() || raw == "." || raw == ".." {
            return Err(anyhow!("key {raw:?} cannot be used as a URL path segment"));
        }
        let mut scratch = self.base.clone();
        scratch
            .path_segments_mut()
            .map_err(|()| anyhow!("URL template cannot carry a path"))?
            .clear()
            .push(&raw);
        let encoded = scratch.path().trim_start_matches('/');
        let mut url = self.base.clone();
        url.set_path(&self.base.path().replace(KEY_MARKER, encoded));
        Ok(url)
    }
}

#[derive(Debug)]
struct Settings {
    url_template: UrlTemplate,
    method: Method,
    sends_body: bool,
    backpressure_statuses: Vec<u16>,
    token: Option<String>,
    timeout: Duration,
}

/// Opens one HTTP session per worker.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    settings: Arc<Settings>,
}

impl HttpRemote {
    pub fn new(section: &RemoteSection, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url_template = UrlTemplate::parse(&section.url_template).map_err(|e| {
            tracing::error!(error = %e, url_template = %section.url_template, "Invalid URL template");
            e
        })?;

        let method = match section.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        };
        tracing::info!(
            url_template = %section.url_template,
            %method,
            token_set = token.is_some(),
            "Initialised HTTP remote"
        );
        Ok(Self {
            settings: Arc::new(Settings {
                url_template,
                method,
                sends_body: section.method.sends_body(),
                backpressure_statuses: section.backpressure_statuses.clone(),
                token,
                timeout,
            }),
        })
    }
}

impl SessionFactory for HttpRemote {
    fn open_session(&self, worker_id: usize) -> Result<Box<dyn RemoteCall>, SessionError> {
        let client = Client::builder()
            .timeout(self.settings.timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| {
                tracing::error!(worker_id, error = %e, "Failed to build HTTP client");
                e
            })?;
        tracing::debug!(worker_id, "Opened HTTP session");
        Ok(Box::new(HttpSession {
            client,
            settings: self.settings.clone(),
        }))
    }
}

struct HttpSession {
    client: Client,
    settings: Arc<Settings>,
}

#[async_trait]
impl RemoteCall for HttpSession {
    async fn call(&self, op: &Operation) -> RemoteOutcome {
        let started = Instant::now();
        let url = match self.settings.url_template.render(&op.key) {
            Ok(url) => url,
            Err(e) => {
                return RemoteOutcome::new(RemoteStatus::PermanentFailure)
                    .with_message(e.to_string())
                    .with_latency(started.elapsed())
            }
        };

        let mut request = self
            .client
            .request(self.settings.method.clone(), url)
            .header("Idempotency-Key", idempotency_key(op));
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        if self.settings.sends_body {
            request = request.json(&op.payload);
        }

        let outcome = match request.send().await {
            Ok(response) => classify_response(response, &self.settings.backpressure_statuses).await,
            Err(e) => classify_error(&e),
        };
        tracing::debug!(
            key = %op.key,
            status = ?outcome.status,
            code = ?outcome.status_code,
            "Remote call returned"
        );
        outcome.with_latency(started.elapsed())
    }
}

/// Maps an HTTP response onto the engine's outcome classes.
pub async fn classify_response(response: Response, backpressure_statuses: &[u16]) -> RemoteOutcome {
    let status = response.status();
    let code = status.as_u16();
    if status.is_success() {
        return RemoteOutcome::success().with_code(code);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let message = truncate(body.trim(), MAX_MESSAGE_BYTES);

    let kind = if backpressure_statuses.contains(&code) {
        RemoteStatus::RateLimited
    } else if code == 408 || status.is_server_error() {
        RemoteStatus::TransientFailure
    } else {
        RemoteStatus::PermanentFailure
    };
    let mut outcome = RemoteOutcome::new(kind).with_code(code);
    if !message.is_empty() {
        outcome = outcome.with_message(message);
    }
    if let Some(after) = retry_after {
        outcome = outcome.with_retry_after(after);
    }
    outcome
}

pub fn classify_error(e: &reqwest::Error) -> RemoteOutcome {
    if e.is_builder() {
        return RemoteOutcome::new(RemoteStatus::PermanentFailure)
            .with_message(format!("invalid request: {e}"));
    }
    RemoteOutcome::transient(if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    })
}

/// Reads a `Retry-After` value: delay seconds, or an HTTP date turned
/// into the delay from now. Dates in the past mean "retry now".
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or_default())
}

/// Hex SHA-256 over the key and the serialised payload.
pub fn idempotency_key(op: &Operation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(op.key.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(op.payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
