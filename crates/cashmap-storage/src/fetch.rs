//! Polite HTTP fetching for listing pages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// The source explicitly refused us; retrying only makes it worse.
    Blocked,
    NonRetryable,
}

impl RetryDisposition {
    pub fn of_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => RetryDisposition::Blocked,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                RetryDisposition::Retryable
            }
            s if s.is_server_error() => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

/// Bounded exponential backoff. A server-sent `Retry-After` replaces the computed delay
/// but is still capped at `max_delay`.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|d| d.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Delay-seconds form of `Retry-After`; the HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Used when a request carries no identity of its own.
    pub default_user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Sustained request rate across all sources; `None` disables pacing.
    pub requests_per_second: Option<f64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            default_user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            requests_per_second: None,
        }
    }
}

/// Token bucket with continuous refill. `acquire` sleeps exactly as long as the next
/// token takes to accrue.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            per_second: per_second.max(f64::MIN_POSITIVE),
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last) = *state;
                let now = Instant::now();
                let tokens = (tokens + now.duration_since(last).as_secs_f64() * self.per_second)
                    .min(self.capacity);
                if tokens >= 1.0 {
                    *state = (tokens - 1.0, now);
                    return;
                }
                *state = (tokens, now);
                Duration::from_secs_f64((1.0 - tokens) / self.per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-request fetch identity (a device profile's user agent plus extra headers).
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RequestIdentity {
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: Some(user_agent.into()),
            headers: Vec::new(),
        }
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(ua) = self.user_agent.as_deref().and_then(|ua| HeaderValue::from_str(ua).ok()) {
            map.insert(USER_AGENT, ua);
        }
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid request header"),
            }
        }
        map
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to listing failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("source refused access with status {status} at {url}")]
    Blocked { status: u16, url: String },
}

enum Attempt {
    Done(Result<FetchedResponse, FetchError>),
    Retry {
        cause: String,
        retry_after: Option<Duration>,
        last: FetchError,
    },
}

/// Shared client for every crawl unit. A global cap bounds all in-flight requests and a
/// per-source cap bounds load against any one site.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_source_limit: usize,
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacing: Option<TokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.default_user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building listing http client")?;

        let pacing = config
            .requests_per_second
            .filter(|rps| *rps > 0.0)
            .map(|rps| TokenBucket::new(rps, config.global_concurrency.max(1) as u32));

        Ok(Self {
            client,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            sources: Mutex::new(HashMap::new()),
            pacing,
            backoff: config.backoff,
        })
    }

    async fn source_permits(&self, source_id: &str) -> Arc<Semaphore> {
        self.sources
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_identity(run_id, source_id, url, &RequestIdentity::default())
            .await
    }

    /// GET `url` as `identity`, holding one per-source and one global permit for the
    /// whole retry sequence.
    pub async fn fetch_with_identity(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        identity: &RequestIdentity,
    ) -> Result<FetchedResponse, FetchError> {
        // Source first: a request queued behind a busy site must not sit on a global slot.
        let source = self.source_permits(source_id).await;
        let _source = source.acquire().await.expect("source semaphore is never closed");
        let _global = self.global.acquire().await.expect("global semaphore is never closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url, identity.header_map())
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(pacing) = &self.pacing {
                pacing.acquire().await;
            }
            let outcome = match self.client.get(url).headers(headers.clone()).send().await {
                Ok(resp) => Self::read_response(resp).await,
                Err(err) => Self::request_failed(err),
            };
            match outcome {
                Attempt::Done(result) => return result,
                Attempt::Retry { last, .. } if attempt >= self.backoff.max_retries => {
                    return Err(last)
                }
                Attempt::Retry {
                    cause, retry_after, ..
                } => {
                    let delay = self.backoff.delay(attempt, retry_after);
                    warn!(%cause, attempt, delay_ms = delay.as_millis() as u64, "retrying listing fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn read_response(resp: Response) -> Attempt {
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status.is_success() {
            return match resp.bytes().await {
                Ok(body) => {
                    debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                    Attempt::Done(Ok(FetchedResponse {
                        status,
                        final_url,
                        body: body.to_vec(),
                    }))
                }
                Err(err) => Self::request_failed(err),
            };
        }
        match RetryDisposition::of_status(status) {
            RetryDisposition::Retryable => Attempt::Retry {
                cause: format!("http status {}", status.as_u16()),
                retry_after: retry_after(resp.headers()),
                last: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            },
            RetryDisposition::Blocked => Attempt::Done(Err(FetchError::Blocked {
                status: status.as_u16(),
                url: final_url,
            })),
            RetryDisposition::NonRetryable => Attempt::Done(Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            })),
        }
    }

    fn request_failed(err: reqwest::Error) -> Attempt {
        match RetryDisposition::of_error(&err) {
            RetryDisposition::Retryable => Attempt::Retry {
                cause: err.to_string(),
                retry_after: None,
                last: FetchError::Request(err),
            },
            _ => Attempt::Done(Err(FetchError::Request(err))),
        }
    }
}
