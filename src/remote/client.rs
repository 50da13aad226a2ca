//! HTTP Client Pool: authenticated identities with retry classification and
//! arbiter-gated selection.

use crate::arbiter::{ArbiterError, ClientId, RateArbiter};
use crate::config::CookiePair;
use crate::error::{ApiError, TransportError};
use crate::remote::types::{parse_rate_limit_headers, RateLimitHeaders};
use crate::retry::RetryPolicy;
use crate::{Backoff, Jitter, ResilienceError};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const MAX_RETRY_ATTEMPTS: usize = 5;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_CONNS: usize = 1000;

/// The host serving media assets, which bypasses the arbiter entirely.
pub fn is_cdn_host(host: &str) -> bool {
    host.ends_with("twimg.com")
}

/// One authenticated identity in the pool.
pub struct ClientIdentity {
    pub id: ClientId,
    pub handle: String,
    http: reqwest::Client,
    sticky_error: AtomicBool,
    sticky_code: std::sync::Mutex<Option<i32>>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("sticky", &self.sticky_error.load(Ordering::Relaxed))
            .finish()
    }
}

impl ClientIdentity {
    pub fn build(id: ClientId, handle: String, cookie: &CookiePair) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "cookie",
            format!("auth_token={}; ct0={}", cookie.auth_token, cookie.ct0).parse().unwrap(),
        );
        headers.insert("x-csrf-token", cookie.ct0.parse().unwrap());

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .bearer_auth(&cookie.auth_token)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .timeout(HEADER_TIMEOUT)
            .build()?;

        Ok(Self { id, handle, http, sticky_error: AtomicBool::new(false), sticky_code: std::sync::Mutex::new(None) })
    }

    /// Resolve this identity's own handle via the account-settings endpoint,
    /// used at startup to label the identity and to dedup
    /// `additional_cookies.yaml` entries that resolve to the same account.
    /// Bypasses the arbiter entirely: this is a one-shot login call, not a
    /// timeline request under a shared quota.
    pub async fn resolve_handle(&self) -> Result<String, reqwest::Error> {
        let response =
            self.http.get("https://api.x.com/1.1/account/settings.json").send().await?.error_for_status()?;
        let body = response.text().await?;
        let handle = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("screen_name").and_then(|s| s.as_str()).map(str::to_string))
            .unwrap_or_default();
        Ok(handle)
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky_error.load(Ordering::Acquire)
    }

    pub fn mark_sticky(&self, code: i32) {
        self.sticky_error.store(true, Ordering::Release);
        *self.sticky_code.lock().unwrap_or_else(|p| p.into_inner()) = Some(code);
    }
}

/// Retry predicate classifying a [`TransportError`] as retry-worthy.
pub fn should_retry(err: &TransportError) -> bool {
    match err {
        TransportError::WouldBlock | TransportError::Cancelled => false,
        TransportError::Network(_) => true,
        TransportError::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16(),
        TransportError::Api(api) => api.is_transient(),
    }
}

fn retry_policy() -> RetryPolicy<TransportError> {
    RetryPolicy::builder()
        .max_attempts(MAX_RETRY_ATTEMPTS)
        .expect("MAX_RETRY_ATTEMPTS > 0")
        .backoff(Backoff::exponential(Duration::from_millis(500)).with_max(Duration::from_secs(30)))
        .with_jitter(Jitter::full())
        .should_retry(should_retry)
        .build()
}

/// Screen a response body for a service-level `errors[]` array.
pub fn screen_for_api_error(body: &str) -> Option<ApiError> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let first = value.get("errors")?.as_array()?.first()?;
    let code = first.get("code").and_then(serde_json::Value::as_i64).unwrap_or(-1) as i32;
    Some(ApiError::new(code, first.to_string()))
}

/// Per-`(client, path)` request tally, surfaced as a summary log line under
/// `--dbg` (`spec.md` §6). A plain `Mutex`-guarded map of `AtomicU64` counts,
/// the same registry shape the Rate Arbiter uses for its slot table.
#[derive(Default)]
pub struct RequestCounters {
    counts: Mutex<HashMap<(ClientId, String), AtomicU64>>,
}

impl RequestCounters {
    fn record(&self, client: ClientId, path: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        counts.entry((client, path.to_string())).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every `(client, path) -> count` pair observed so far.
    pub fn snapshot(&self) -> Vec<((ClientId, String), u64)> {
        let counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        counts.iter().map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed))).collect()
    }

    /// Emit one `info!` summary line per observed `(client, path)` pair.
    pub fn log_summary(&self) {
        for ((client, path), count) in self.snapshot() {
            info!(client, path = %path, requests = count, "endpoint request count");
        }
    }
}

/// Pool of authenticated identities with retry classification, shared error
/// state, and a selection policy gated on the [`RateArbiter`].
pub struct ClientPool {
    pub clients: Vec<Arc<ClientIdentity>>,
    arbiter: Arc<RateArbiter>,
    pub counters: RequestCounters,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("every client identity has a sticky error; the run cannot continue")]
    AllClientsSticky,
    #[error("run cancelled while selecting a client")]
    Cancelled,
}

impl ClientPool {
    pub fn new(clients: Vec<Arc<ClientIdentity>>, arbiter: Arc<RateArbiter>) -> Self {
        Self { clients, arbiter, counters: RequestCounters::default() }
    }

    /// Selection policy: iterate clients, return the first with no sticky
    /// error whose arbiter probe for `path` would not block. If
    /// all would block, sleep 3s and retry until cancelled; if all are
    /// sticky, fail outright.
    pub async fn select(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<Arc<ClientIdentity>, SelectionError> {
        loop {
            if self.clients.iter().all(|c| c.is_sticky()) {
                return Err(SelectionError::AllClientsSticky);
            }
            for client in &self.clients {
                if client.is_sticky() {
                    continue;
                }
                if self.arbiter.would_admit(client.id, path).await {
                    return Ok(client.clone());
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3)) => continue,
                _ = cancel.cancelled() => return Err(SelectionError::Cancelled),
            }
        }
    }

    /// Issue a GET against `path` on `client`, gated by the arbiter and
    /// retried per [`should_retry`]. Returns the parsed body and any
    /// rate-limit headers observed on the final attempt.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        client: &ClientIdentity,
        url: &str,
        path: &str,
    ) -> Result<(String, Option<RateLimitHeaders>), ResilienceError<TransportError>> {
        let host_is_cdn = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)).map(|h| is_cdn_host(&h)).unwrap_or(false);

        let policy = retry_policy();
        policy
            .execute(|| async {
                self.counters.record(client.id, path);
                if !host_is_cdn {
                    if let Err(e) = self.arbiter.check(cancel, client.id, path, false).await {
                        let err = match e {
                            ArbiterError::WouldBlock => TransportError::WouldBlock,
                            ArbiterError::Cancelled => TransportError::Cancelled,
                        };
                        return Err(ResilienceError::Inner(err));
                    }
                }

                let response = match client.http.get(url).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        if !host_is_cdn {
                            self.arbiter.reset(client.id, path);
                        }
                        return Err(ResilienceError::Inner(TransportError::Network(e)));
                    }
                };

                let status = response.status();
                let headers = parse_rate_limit_headers(response.headers());
                let body = response.text().await.unwrap_or_default();

                if !host_is_cdn {
                    self.arbiter.settle(client.id, path, headers);
                }

                if let Some(api_err) = screen_for_api_error(&body) {
                    if api_err.is_sticky() {
                        client.mark_sticky(api_err.code);
                    }
                    return Err(ResilienceError::Inner(TransportError::Api(api_err)));
                }

                if !status.is_success() {
                    return Err(ResilienceError::Inner(TransportError::Status {
                        status: status.as_u16(),
                        body: body.clone(),
                    }));
                }

                Ok((body, headers))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdn_host_is_recognized() {
        assert!(is_cdn_host("pbs.twimg.com"));
        assert!(!is_cdn_host("api.x.com"));
    }

    #[test]
    fn should_retry_network_errors() {
        // Network variant can't be constructed directly without a live reqwest::Error;
        // exercise the other branches instead.
        assert!(!should_retry(&TransportError::WouldBlock));
        assert!(!should_retry(&TransportError::Cancelled));
    }

    #[test]
    fn should_retry_transient_api_codes() {
        assert!(should_retry(&TransportError::Api(ApiError::new(0, "dependency"))));
        assert!(should_retry(&TransportError::Api(ApiError::new(29, "timeout"))));
        assert!(should_retry(&TransportError::Api(ApiError::new(130, "capacity"))));
        assert!(!should_retry(&TransportError::Api(ApiError::new(88, "limit"))));
    }

    #[test]
    fn should_retry_429_but_not_other_statuses() {
        assert!(should_retry(&TransportError::Status { status: 429, body: String::new() }));
        assert!(!should_retry(&TransportError::Status { status: 404, body: String::new() }));
        assert!(!should_retry(&TransportError::Status { status: 403, body: String::new() }));
    }

    #[test]
    fn screen_for_api_error_extracts_first_code() {
        let body = r#"{"errors":[{"code":88,"message":"rate limit"}]}"#;
        let err = screen_for_api_error(body).unwrap();
        assert_eq!(err.code, 88);
    }

    #[test]
    fn screen_for_api_error_none_when_absent() {
        assert!(screen_for_api_error(r#"{"data":{}}"#).is_none());
    }

    #[test]
    fn request_counters_tally_per_client_and_path() {
        let counters = RequestCounters::default();
        counters.record(1, "/timeline");
        counters.record(1, "/timeline");
        counters.record(1, "/list");
        counters.record(2, "/timeline");

        let snapshot = counters.snapshot();
        let get = |client: ClientId, path: &str| {
            snapshot.iter().find(|(k, _)| *k == (client, path.to_string())).map(|(_, v)| *v)
        };
        assert_eq!(get(1, "/timeline"), Some(2));
        assert_eq!(get(1, "/list"), Some(1));
        assert_eq!(get(2, "/timeline"), Some(1));
    }
}
