use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Host component of an absolute URL, used as the per-host concurrency key.
pub fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// Capped exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_host: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_host: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// One GET issued through [`HttpFetcher`].
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub bearer_token: Option<&'a str>,
    pub max_bytes: Option<usize>,
}

impl<'a> FetchRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            url,
            bearer_token: None,
            max_bytes: None,
        }
    }

    pub fn bearer(mut self, token: Option<&'a str>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn max_bytes(mut self, limit: usize) -> Self {
        self.max_bytes = Some(limit);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// Whether the same request may succeed later: timeouts, connection trouble, 5xx and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(status)
            }
            Self::Closed => true,
            Self::InvalidUrl(_) | Self::TooLarge { .. } => false,
        }
    }
}

/// Shared reqwest client bounded globally and per host, retrying transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    per_host_limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_host_limit: config.max_in_flight_per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn host_permits(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn get(&self, run_id: Uuid, request: FetchRequest<'_>) -> Result<FetchedBody, FetchError> {
        let host = url_host(request.url).ok_or_else(|| FetchError::InvalidUrl(request.url.to_string()))?;
        let _total = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let host_permits = self.host_permits(&host).await;
        let _host = host_permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, %host, url = request.url);
        async {
            let mut retry = 0;
            loop {
                match self.attempt(&request).await {
                    Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                        debug!(error = %err, retry, "retrying http fetch");
                        tokio::time::sleep(self.retry.delay(retry)).await;
                        retry += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &FetchRequest<'_>) -> Result<FetchedBody, FetchError> {
        let transport = |source| FetchError::Transport {
            url: request.url.to_string(),
            source,
        };
        let mut call = self.client.get(request.url);
        if let Some(token) = request.bearer_token {
            call = call.bearer_auth(token);
        }
        let mut resp = call.send().await.map_err(transport)?;

        let final_url = resp.url().to_string();
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let too_large = |limit| FetchError::TooLarge {
            url: final_url.clone(),
            limit,
        };
        if let (Some(limit), Some(declared)) = (request.max_bytes, resp.content_length()) {
            if declared > limit as u64 {
                return Err(too_large(limit));
            }
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut bytes = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(transport)? {
            bytes.extend_from_slice(&chunk);
            if let Some(limit) = request.max_bytes.filter(|limit| bytes.len() > *limit) {
                return Err(too_large(limit));
            }
        }
        Ok(FetchedBody {
            final_url,
            content_type,
            bytes,
        })
    }
}
