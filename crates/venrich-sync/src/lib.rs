//! Provider chain runner, request cache and configuration for venrich.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, info_span, Instrument};
use venrich_adapters::{default_chain, provider_for_id, Provider, ProviderContext, ProviderSettings};
use venrich_core::{merge_into, BusinessData};
use venrich_storage::{HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "venrich-sync";

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub providers: ProviderSettings,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// YAML chain registry; the default chain is used when unset.
    pub chain_file: Option<PathBuf>,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ProviderSettings::default();
        Self {
            providers: ProviderSettings {
                postcodes_url: lookup("VENRICH_POSTCODES_URL").unwrap_or(defaults.postcodes_url),
                places_enabled: lookup("VENRICH_PLACES_ENABLED")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(defaults.places_enabled),
                places_url: lookup("VENRICH_PLACES_URL").unwrap_or(defaults.places_url),
                gazetteer_url: lookup("VENRICH_GAZETTEER_URL").unwrap_or(defaults.gazetteer_url),
                contact_email: lookup("VENRICH_CONTACT_EMAIL").unwrap_or(defaults.contact_email),
                accept_language: lookup("VENRICH_ACCEPT_LANGUAGE")
                    .unwrap_or(defaults.accept_language),
            },
            user_agent: lookup("VENRICH_USER_AGENT").unwrap_or_else(|| "venrich/0.1".to_string()),
            http_timeout_secs: lookup("VENRICH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            cache_ttl_secs: lookup("VENRICH_CACHE_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            chain_file: lookup("VENRICH_CHAIN_FILE").map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            ..HttpClientConfig::default()
        }
    }

    pub fn build_chain(&self) -> Result<Vec<Arc<dyn Provider>>> {
        match &self.chain_file {
            Some(path) => Ok(ChainRegistry::load(path)?.build(&self.providers)?),
            None => Ok(default_chain(&self.providers)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown provider id `{0}` in chain registry")]
    UnknownProvider(String),
    #[error("chain registry enables no providers")]
    EmptyChain,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainRegistry {
    pub providers: Vec<ChainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainEntry {
    pub provider_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ChainRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading chain registry {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing chain registry {}", path.display()))
    }

    /// Enabled providers in file order.
    pub fn build(&self, settings: &ProviderSettings) -> Result<Vec<Arc<dyn Provider>>, ConfigError> {
        let mut chain = Vec::new();
        for entry in &self.providers {
            let provider = provider_for_id(&entry.provider_id, settings)
                .ok_or_else(|| ConfigError::UnknownProvider(entry.provider_id.clone()))?;
            if entry.enabled {
                chain.push(provider);
            }
        }
        if chain.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        Ok(chain)
    }
}

/// Runs `providers` in order against an accumulating copy of `ctx.seed`.
///
/// Each provider sees the merge output of the ones before it. Fields a
/// provider fills are attributed to it in `meta.provenance`. A panicking
/// provider aborts the whole request.
pub async fn run_chain(
    http: &HttpFetcher,
    ctx: &ProviderContext,
    providers: &[Arc<dyn Provider>],
) -> BusinessData {
    let mut current = ctx.seed.clone();

    for provider in providers {
        let provider_id = provider.provider_id();
        let Some(out) = provider.enrich(http, ctx, &current).await else {
            debug!(provider = provider_id, "no contribution");
            continue;
        };
        let filled = merge_into(&mut current, out);
        for field in &filled {
            current
                .meta
                .provenance
                .entry(field.clone())
                .or_insert_with(|| provider_id.to_string());
        }
        debug!(provider = provider_id, filled = ?filled, "merged provider output");
    }

    current
}

/// `lowercase(name)|UPPERCASE(postcode)`.
pub fn request_key(name: &str, postcode: Option<&str>) -> String {
    format!(
        "{}|{}",
        name.to_lowercase(),
        postcode.unwrap_or_default().to_uppercase()
    )
}

/// Completed results plus in-flight runs, both keyed by [`request_key`].
///
/// Locks are always taken completed-then-inflight, so a finished result is
/// visible in `completed` before its in-flight entry disappears.
#[derive(Debug, Default)]
pub struct RequestCache {
    completed: Mutex<HashMap<String, BusinessData>>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<BusinessData>>>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_run<F, Fut>(&self, key: &str, run: F) -> BusinessData
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BusinessData>,
    {
        let cell = {
            let completed = self.completed.lock().await;
            if let Some(hit) = completed.get(key) {
                debug!(key, "request cache hit");
                return hit.clone();
            }
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.to_string()).or_default().clone()
        };

        let value = cell.get_or_init(run).await.clone();

        let mut completed = self.completed.lock().await;
        let mut inflight = self.inflight.lock().await;
        // After a clear() the cell is orphaned and must not repopulate the cache.
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            completed.insert(key.to_string(), value.clone());
            inflight.remove(key);
        }
        value
    }

    pub async fn clear(&self) {
        let mut completed = self.completed.lock().await;
        let mut inflight = self.inflight.lock().await;
        completed.clear();
        inflight.clear();
    }

    pub async fn completed_len(&self) -> usize {
        self.completed.lock().await.len()
    }

    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

/// Consumer-facing entry point: chain + fetch layer + request cache.
pub struct Enricher {
    http: Arc<HttpFetcher>,
    chain: Vec<Arc<dyn Provider>>,
    cache: RequestCache,
}

impl Enricher {
    pub fn new(http: Arc<HttpFetcher>, chain: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            http,
            chain,
            cache: RequestCache::new(),
        }
    }

    pub fn from_config(config: &EnrichConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let chain = config.build_chain()?;
        Ok(Self::new(Arc::new(http), chain))
    }

    pub fn chain_ids(&self) -> Vec<&'static str> {
        self.chain.iter().map(|p| p.provider_id()).collect()
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Enrich `seed`, sharing work with identical concurrent requests and
    /// answering repeats from cache. `custom_chain` replaces the configured
    /// chain but does not take part in the cache key.
    pub async fn enrich(
        &self,
        venue_id: &str,
        seed: BusinessData,
        custom_chain: Option<&[Arc<dyn Provider>]>,
    ) -> BusinessData {
        let key = request_key(&seed.name, seed.postcode.as_deref());
        let providers = custom_chain.unwrap_or(&self.chain);
        let http = self.http.as_ref();
        let log_key = key.clone();

        self.cache
            .get_or_run(&key, move || {
                let ctx = ProviderContext::new(venue_id, seed);
                let span = info_span!(
                    "enrich",
                    request_id = %ctx.request_id,
                    venue_id = %ctx.venue_id,
                );
                async move {
                    info!(key = %log_key, providers = providers.len(), "running provider chain");
                    let out = run_chain(http, &ctx, providers).await;
                    info!(filled = out.meta.provenance.len(), "provider chain finished");
                    out
                }
                .instrument(span)
            })
            .await
    }

    /// Debug hook: forget every cached result and memoized response.
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        self.http.clear_memo().await;
    }
}
