//! Batched, rate-limited and retrying HTTP fetch engine.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use smc_core::{AuthError, CollectorError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "smc-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("request aborted: {0}")]
    Aborted(String),
    /// Credentials were rejected in a way only the operator can fix.
    #[error("authorization failed: {0}")]
    Auth(AuthError),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            FetchError::Aborted(_) | FetchError::Auth(_) => RetryDisposition::NonRetryable,
            FetchError::Request(_) | FetchError::Decode { .. } | FetchError::Transient(_) => {
                RetryDisposition::Retryable
            }
        }
    }
}

impl From<FetchError> for CollectorError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Auth(auth) => CollectorError::Auth(auth),
            other => CollectorError::TransientApi(other.to_string()),
        }
    }
}

/// Attempt budget plus the backoff applied between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Rate-limited attempts wait `attempt * rate_limit_step`.
    pub rate_limit_step: Duration,
    /// Fixed wait after any other retryable failure.
    pub error_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_step: Duration::from_secs(10),
            error_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, FetchError>,
    pub attempts: u32,
    pub waits: Vec<Duration>,
}

impl RetryPolicy {
    /// Wait before the next attempt after `attempt` (1-based) failed, or `None` when exhausted.
    pub fn delay_after(&self, attempt: u32, disposition: RetryDisposition) -> Option<Duration> {
        if attempt >= self.max_attempts.max(1) {
            return None;
        }
        match disposition {
            RetryDisposition::RateLimited => Some(self.rate_limit_step.saturating_mul(attempt)),
            RetryDisposition::Retryable => Some(self.error_delay),
            RetryDisposition::NonRetryable => None,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut waits = Vec::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(request = label, attempt, "issuing request");
            match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                        waits,
                    }
                }
                Err(err) => match self.delay_after(attempt, err.disposition()) {
                    Some(delay) => {
                        warn!(
                            request = label,
                            attempt,
                            max_attempts = self.max_attempts,
                            wait_secs = delay.as_secs_f64(),
                            error = %err,
                            "request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        waits.push(delay);
                    }
                    None => {
                        error!(request = label, attempts = attempt, error = %err, "request failed");
                        return Attempted {
                            result: Err(err),
                            attempts: attempt,
                            waits,
                        };
                    }
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Requests in flight per batch; providers here cap at 5 per second.
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            inter_batch_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

pub trait FetchRequest {
    fn name(&self) -> &str;
}

#[async_trait]
pub trait RequestExecutor<R: Send + Sync>: Send + Sync {
    type Output: Send;

    async fn execute(&self, request: &R) -> Result<Self::Output, FetchError>;
}

/// Terminal outcome for one request descriptor.
#[derive(Debug)]
pub struct RequestOutcome<R, T> {
    pub request: R,
    pub result: Result<T, FetchError>,
    pub attempts: u32,
    pub waits: Vec<Duration>,
}

impl<R, T> RequestOutcome<R, T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchFetcher {
    config: BatchConfig,
}

impl BatchFetcher {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Runs every request, batch by batch. Outcomes keep the input order and
    /// a failing request never cancels its siblings.
    pub async fn fetch_all<R, E>(
        &self,
        requests: Vec<R>,
        executor: &E,
    ) -> Vec<RequestOutcome<R, E::Output>>
    where
        R: FetchRequest + Send + Sync,
        E: RequestExecutor<R> + ?Sized,
    {
        let batch_size = self.config.batch_size.max(1);
        let total = requests.len();
        let mut batches: Vec<Vec<R>> = Vec::new();
        let mut pending = requests.into_iter().peekable();
        while pending.peek().is_some() {
            batches.push(pending.by_ref().take(batch_size).collect());
        }

        let batch_count = batches.len();
        let mut outcomes = Vec::with_capacity(total);
        for (index, batch) in batches.into_iter().enumerate() {
            info!(
                batch = index + 1,
                batches = batch_count,
                size = batch.len(),
                "dispatching request batch"
            );
            let in_flight = batch
                .into_iter()
                .map(|request| self.fetch_one(request, executor));
            outcomes.extend(join_all(in_flight).await);

            if index + 1 < batch_count {
                debug!(
                    delay_secs = self.config.inter_batch_delay.as_secs_f64(),
                    "pausing between batches"
                );
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }
        outcomes
    }

    async fn fetch_one<R, E>(&self, request: R, executor: &E) -> RequestOutcome<R, E::Output>
    where
        R: FetchRequest + Send + Sync,
        E: RequestExecutor<R> + ?Sized,
    {
        let span = info_span!("api_request", request = request.name());
        let attempted = self
            .config
            .retry
            .run(request.name(), || executor.execute(&request))
            .instrument(span)
            .await;
        RequestOutcome {
            request,
            result: attempted.result,
            attempts: attempted.attempts,
            waits: attempted.waits,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("smc/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Single-attempt JSON client; retries belong to [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn get_json(&self, url: &str, headers: HeaderMap) -> Result<JsonValue, FetchError> {
        let resp = self.client.get(url).headers(headers).send().await?;
        read_json(resp).await
    }
}

/// Decodes a successful response body; any non-2xx status becomes [`FetchError::HttpStatus`].
pub async fn read_json(resp: reqwest::Response) -> Result<JsonValue, FetchError> {
    let status = resp.status();
    let url = resp.url().to_string();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url,
            body,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
        url,
        reason: e.to_string(),
    })
}
