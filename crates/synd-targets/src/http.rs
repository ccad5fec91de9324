//! Rate-limited JSON transport for target APIs, with retry and capped backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all targets.
    pub global_concurrency: usize,
    /// Requests in flight against any one target.
    pub per_target_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Applied to each target separately; `None` sends as fast as the slots allow.
    pub rate_limit: Option<TargetRateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_target_concurrency: 1,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// `burst` requests back to back, then one every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRateLimit {
    pub burst: u32,
    pub interval: Duration,
}

/// Per-target pacing. Tracks the instant the target's allowance is next fully
/// spent; each send pushes it out by one interval.
#[derive(Debug)]
pub struct TargetRateLimiter {
    limit: TargetRateLimit,
    spent_until: Mutex<Instant>,
}

impl TargetRateLimiter {
    pub fn new(limit: TargetRateLimit) -> Self {
        Self {
            limit,
            spent_until: Mutex::new(Instant::now()),
        }
    }

    /// Reserves the next slot and returns how long the caller must wait for it.
    async fn reserve(&self) -> Duration {
        let mut spent_until = self.spent_until.lock().await;
        let now = Instant::now();
        let next = (*spent_until).max(now) + self.limit.interval;
        *spent_until = next;
        let allowance = self.limit.interval.saturating_mul(self.limit.burst.max(1));
        next.saturating_duration_since(now + allowance)
    }

    pub async fn wait_turn(&self) {
        let wait = self.reserve().await;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
struct TargetLane {
    slots: Semaphore,
    pacing: Option<TargetRateLimiter>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// One shared client for all targets. Each target gets its own lane (slots and
/// pacing) so a slow portal cannot starve the others.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    global_limit: Semaphore,
    per_target_limit: usize,
    rate_limit: Option<TargetRateLimit>,
    lanes: Mutex<HashMap<String, Arc<TargetLane>>>,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            per_target_limit: config.per_target_concurrency.max(1),
            rate_limit: config.rate_limit,
            lanes: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn lane(&self, target_id: &str) -> Arc<TargetLane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(target_id.to_string())
            .or_insert_with(|| {
                Arc::new(TargetLane {
                    slots: Semaphore::new(self.per_target_limit),
                    pacing: self.rate_limit.map(TargetRateLimiter::new),
                })
            })
            .clone()
    }

    /// Sends `body` as JSON, retrying transient failures. `idempotency_key` is sent
    /// on every try so a target can fold retried submissions together.
    pub async fn send_json(
        &self,
        target_id: &str,
        method: Method,
        url: &str,
        idempotency_key: &str,
        body: &JsonValue,
    ) -> Result<HttpResponse, FetchError> {
        // Semaphores here are never closed, so acquire cannot fail.
        let lane = self.lane(target_id).await;
        let _target = lane.slots.acquire().await.ok();
        let _global = self.global_limit.acquire().await.ok();
        if let Some(pacing) = &lane.pacing {
            pacing.wait_turn().await;
        }

        let span = info_span!("target_http", target_id, url, %method);
        self.send_with_retries(method, url, idempotency_key, body)
            .instrument(span)
            .await
    }

    async fn send_with_retries(
        &self,
        method: Method,
        url: &str,
        idempotency_key: &str,
        body: &JsonValue,
    ) -> Result<HttpResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let result = self
                .client
                .request(method.clone(), url)
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .send()
                .await;

            let last_error = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(HttpResponse { status, body });
                    }
                    let final_url = resp.url().to_string();
                    let text = resp.text().await.unwrap_or_default();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: text,
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(last_error);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, error = %last_error, "retrying target request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
