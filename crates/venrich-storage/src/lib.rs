//! HTTP fetch layer for venrich: URL memo, per-host FIFO queues and host pacing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub use reqwest::Url;

pub const CRATE_NAME: &str = "venrich-storage";

/// Public gazetteer host; its usage policy allows roughly one request a second.
pub const GAZETTEER_HOST: &str = "nominatim.openstreetmap.org";
pub const GAZETTEER_DELAY: Duration = Duration::from_millis(1100);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {reason}")]
    Decode { url: String, reason: String },
    #[error("no fixture registered for {0}")]
    NoFixture(String),
}

/// The network leg of a fetch. Everything above it (memo, queues, pacing)
/// lives in [`HttpFetcher`].
#[async_trait]
pub trait JsonTransport: Send + Sync + fmt::Debug {
    async fn get_json(&self, url: &Url, headers: &[(&str, &str)]) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub cache_ttl: Duration,
    /// Minimum gap between consecutive requests, keyed by lowercase host.
    pub host_delays: HashMap<String, Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            cache_ttl: Duration::from_secs(5 * 60),
            host_delays: HashMap::from([(GAZETTEER_HOST.to_string(), GAZETTEER_DELAY)]),
        }
    }
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonTransport for ReqwestTransport {
    async fn get_json(&self, url: &Url, headers: &[(&str, &str)]) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
enum FixtureReply {
    Json(JsonValue),
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub at: Instant,
}

/// Replays canned JSON by URL prefix (longest prefix wins) and records every
/// call. Unmatched URLs fail with [`FetchError::NoFixture`].
#[derive(Debug, Default)]
pub struct FixtureTransport {
    routes: Vec<(String, FixtureReply)>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(mut self, url_prefix: impl Into<String>, body: JsonValue) -> Self {
        self.routes.push((url_prefix.into(), FixtureReply::Json(body)));
        self
    }

    pub fn with_status(mut self, url_prefix: impl Into<String>, status: u16) -> Self {
        self.routes.push((url_prefix.into(), FixtureReply::Status(status)));
        self
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, url_prefix: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.url.starts_with(url_prefix))
            .count()
    }
}

#[async_trait]
impl JsonTransport for FixtureTransport {
    async fn get_json(&self, url: &Url, headers: &[(&str, &str)]) -> Result<JsonValue, FetchError> {
        let url = url.to_string();
        self.calls.lock().await.push(RecordedCall {
            url: url.clone(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            at: Instant::now(),
        });

        let reply = self
            .routes
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, reply)| reply.clone());

        match reply {
            Some(FixtureReply::Json(body)) => Ok(body),
            Some(FixtureReply::Status(status)) => Err(FetchError::HttpStatus { status, url }),
            None => Err(FetchError::NoFixture(url)),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoEntry {
    value: JsonValue,
    stored_at: Instant,
}

/// Time the previous request on a host finished; the mutex itself is the queue.
type HostQueue = Arc<Mutex<Option<Instant>>>;

#[derive(Debug)]
pub struct HttpFetcher {
    transport: Arc<dyn JsonTransport>,
    cache_ttl: Duration,
    host_delays: HashMap<String, Duration>,
    memo: Mutex<HashMap<String, MemoEntry>>,
    hosts: Mutex<HashMap<String, HostQueue>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: HttpClientConfig, transport: Arc<dyn JsonTransport>) -> Self {
        let host_delays = config
            .host_delays
            .into_iter()
            .map(|(host, delay)| (host.to_ascii_lowercase(), delay))
            .collect();

        Self {
            transport,
            cache_ttl: config.cache_ttl,
            host_delays,
            memo: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn clear_memo(&self) {
        self.memo.lock().await.clear();
    }

    async fn memo_lookup(&self, url: &str) -> Option<JsonValue> {
        let mut memo = self.memo.lock().await;
        let entry = memo.get(url)?;
        if entry.stored_at.elapsed() < self.cache_ttl {
            return Some(entry.value.clone());
        }
        memo.remove(url);
        None
    }

    async fn host_queue(&self, host: &str) -> HostQueue {
        let mut map = self.hosts.lock().await;
        map.entry(host.to_string()).or_default().clone()
    }

    /// GET `url` and decode JSON.
    ///
    /// Requests to one host run one at a time in submission order (the host
    /// mutex is fair), spaced by the host's configured delay. Successful
    /// responses are memoized by exact URL for the cache TTL; failures are not.
    pub async fn fetch_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        if let Some(hit) = self.memo_lookup(url).await {
            debug!(url, "memo hit");
            return Ok(hit);
        }

        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        let queue = self.host_queue(&host).await;
        let mut last_finished = queue.lock().await;

        // An identical request ahead of us in the queue may have filled the memo.
        if let Some(hit) = self.memo_lookup(url).await {
            debug!(url, "memo hit after queue wait");
            return Ok(hit);
        }

        if let (Some(delay), Some(last)) = (self.host_delays.get(&host), *last_finished) {
            let ready_at = last + *delay;
            if ready_at > Instant::now() {
                debug!(host = %host, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "pacing host");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let span = info_span!("http_fetch", host = %host, url);
        let result = self
            .transport
            .get_json(&parsed, headers)
            .instrument(span)
            .await;
        *last_finished = Some(Instant::now());
        drop(last_finished);

        let value = result?;
        let mut memo = self.memo.lock().await;
        let ttl = self.cache_ttl;
        memo.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        memo.insert(
            url.to_string(),
            MemoEntry {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(value)
    }
}
