//! HTTP client for the external record source: bearer-authenticated object
//! and collection fetches with retry classification and backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use paybridge_core::ExternalId;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;

pub const CRATE_NAME: &str = "paybridge-source";

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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Bounds request rate toward the source API. The sync loops are already
/// sequential; the bucket caps bursts from overlapping operations.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for SourceClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4001/api/1.1/obj".to_string(),
            api_token: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `{ "response": <object> }` wrapper around a single fetched object.
#[derive(Debug, Deserialize)]
struct ObjectEnvelope {
    response: JsonValue,
}

/// `{ "response": { "results": [...], "remaining": N } }` wrapper around
/// one collection page.
#[derive(Debug, Deserialize)]
struct ListEnvelope {
    response: ListPage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub results: Vec<JsonValue>,
    #[serde(default)]
    pub remaining: u64,
}

/// Seam between the orchestrator and the wire: the HTTP client implements
/// it in production, tests substitute a scripted double.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_object(
        &self,
        object_type: &str,
        id: &ExternalId,
    ) -> Result<JsonValue, SourceError>;
}

#[derive(Debug)]
pub struct RecordSourceClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    backoff: BackoffPolicy,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl RecordSourceClient {
    pub fn new(config: SourceClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
            token_bucket,
        })
    }

    fn object_url(&self, object_type: &str, id: &ExternalId) -> String {
        format!("{}/{}/{}", self.base_url, object_type, id)
    }

    fn list_url(&self, object_type: &str, limit: usize, cursor: u64) -> String {
        format!(
            "{}/{}?limit={}&cursor={}",
            self.base_url, object_type, limit, cursor
        )
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("source_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if !self.api_token.is_empty() {
                request = request.bearer_auth(&self.api_token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Fetch one collection page. The caller advances the cursor by the
    /// page length until `remaining` reaches zero.
    pub async fn fetch_page(
        &self,
        object_type: &str,
        limit: usize,
        cursor: u64,
    ) -> Result<ListPage, SourceError> {
        let url = self.list_url(object_type, limit, cursor);
        let bytes = self.get_bytes(&url).await?;
        let envelope: ListEnvelope = serde_json::from_slice(&bytes)
            .map_err(|source| SourceError::Decode { url, source })?;
        Ok(envelope.response)
    }

    /// Page through an entire collection and return the raw objects.
    pub async fn fetch_all_results(
        &self,
        object_type: &str,
        page_limit: usize,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let page_limit = page_limit.max(1);
        let mut cursor = 0u64;
        let mut results = Vec::new();

        loop {
            let page = self.fetch_page(object_type, page_limit, cursor).await?;
            let fetched = page.results.len() as u64;
            results.extend(page.results);
            if page.remaining == 0 || fetched == 0 {
                break;
            }
            cursor += fetched;
        }

        Ok(results)
    }
}

#[async_trait]
impl RecordSource for RecordSourceClient {
    async fn fetch_object(
        &self,
        object_type: &str,
        id: &ExternalId,
    ) -> Result<JsonValue, SourceError> {
        let url = self.object_url(object_type, id);
        let bytes = self.get_bytes(&url).await?;
        let envelope: ObjectEnvelope = serde_json::from_slice(&bytes)
            .map_err(|source| SourceError::Decode { url, source })?;
        Ok(envelope.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_targets_transient_failures() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn urls_join_base_type_and_id() {
        let client = RecordSourceClient::new(SourceClientConfig {
            base_url: "https://example.app/api/1.1/obj/".to_string(),
            ..Default::default()
        })
        .expect("client");

        assert_eq!(
            client.object_url("payment", &ExternalId::from("abc123")),
            "https://example.app/api/1.1/obj/payment/abc123"
        );
        assert_eq!(
            client.list_url("payment", 100, 200),
            "https://example.app/api/1.1/obj/payment?limit=100&cursor=200"
        );
    }

    #[test]
    fn list_envelope_decodes_results_and_remaining() {
        let raw = r#"{"response":{"results":[{"_id":"a"},{"_id":"b"}],"remaining":7}}"#;
        let envelope: ListEnvelope = serde_json::from_str(raw).expect("decode");
        assert_eq!(envelope.response.results.len(), 2);
        assert_eq!(envelope.response.remaining, 7);
    }

    #[tokio::test]
    async fn token_bucket_refills_after_interval() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(10));
        bucket.take().await;
        bucket.take().await;
        // Third take must wait for at least one refill interval.
        let started = Instant::now();
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
