//! Cache Registry
//!
//! Owns the configured default cache, its memoized sub-caches and the
//! prometheus registry the caches report into. Built once with
//! [`CacheRegistry::init`] and shared with request handlers; there is no
//! process-global instance.
//!
//! [`CacheRegistry::get_or_fetch`] adds opt-in single-flight: concurrent
//! misses for one key wait on a per-key lock so the producer runs once.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use http::header::HeaderName;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::backend::ResponseCache;
use super::chained::ChainedCache;
use super::entry::{CacheKey, CacheMeta};
use super::file::{FileCacheConfig, SimpleFileCache};
use super::memory::{InMemoryCache, MemoryCacheConfig, MemoryStats};
use super::metrics::CacheMetrics;
use super::response::CacheResponse;
use crate::error::{Error, Result};

/// Which backend the registry builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    /// Memory in front of file
    #[default]
    Chained,
}

/// Top-level cache configuration, loadable from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: BackendKind,
    pub memory: MemoryCacheConfig,
    pub file: FileCacheConfig,
    /// Copy second-tier hits into the memory tier
    pub auto_promote: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            memory: MemoryCacheConfig::default(),
            file: FileCacheConfig::default(),
            auto_promote: true,
        }
    }
}

impl CacheSettings {
    /// Parse settings from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Reject budgets that cannot work
    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        if m.max_item_count == 0 || m.max_memory_bytes == 0 {
            return Err(Error::Config("memory budgets must be non-zero".into()));
        }
        if m.max_item_count_delta > m.max_item_count {
            return Err(Error::Config(format!(
                "max_item_count_delta ({}) exceeds max_item_count ({})",
                m.max_item_count_delta, m.max_item_count
            )));
        }
        if m.max_memory_bytes_delta > m.max_memory_bytes {
            return Err(Error::Config(format!(
                "max_memory_bytes_delta ({}) exceeds max_memory_bytes ({})",
                m.max_memory_bytes_delta, m.max_memory_bytes
            )));
        }
        if self.backend != BackendKind::Memory && self.file.root.as_os_str().is_empty() {
            return Err(Error::Config("file cache root is empty".into()));
        }
        Ok(())
    }
}

/// A freshly produced response handed to [`CacheRegistry::get_or_fetch`]
pub struct Fetched<M> {
    pub response: CacheResponse,
    pub meta: Option<M>,
    pub headers_to_include: Option<Vec<HeaderName>>,
    pub store_uncompressed: bool,
}

impl<M> Fetched<M> {
    /// Store `response` gzip-compressed with the default header allow-list
    pub fn new(response: CacheResponse) -> Self {
        Self {
            response,
            meta: None,
            headers_to_include: None,
            store_uncompressed: false,
        }
    }

    pub fn with_meta(mut self, meta: M) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_headers(mut self, headers: Vec<HeaderName>) -> Self {
        self.headers_to_include = Some(headers);
        self
    }

    pub fn uncompressed(mut self) -> Self {
        self.store_uncompressed = true;
        self
    }
}

/// Registry of configured caches
pub struct CacheRegistry<M> {
    settings: CacheSettings,
    default: Arc<dyn ResponseCache<M>>,
    memory: Option<InMemoryCache<M>>,
    sub_caches: DashMap<String, Arc<dyn ResponseCache<M>>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<CacheMetrics>,
    registry: Registry,
}

impl<M: CacheMeta> CacheRegistry<M> {
    /// Validate settings, register metrics and build the default cache
    pub async fn init(settings: CacheSettings) -> Result<Self> {
        settings.validate()?;

        let registry = Registry::new();
        let metrics = Arc::new(CacheMetrics::new()?);
        metrics.register(&registry)?;

        if settings.backend != BackendKind::Memory {
            tokio::fs::create_dir_all(&settings.file.root).await?;
        }

        let memory = match settings.backend {
            BackendKind::File => None,
            BackendKind::Memory | BackendKind::Chained => Some(InMemoryCache::with_options(
                "memory",
                settings.memory.clone(),
                Some(metrics.clone()),
            )),
        };
        let file = || -> Arc<dyn ResponseCache<M>> {
            Arc::new(SimpleFileCache::with_options(
                "file",
                settings.file.clone(),
                Some(metrics.clone()),
            ))
        };

        let default: Arc<dyn ResponseCache<M>> = match (settings.backend, memory.clone()) {
            (BackendKind::File, _) => file(),
            (BackendKind::Memory, Some(mem)) => Arc::new(mem),
            (BackendKind::Chained, Some(mem)) => Arc::new(
                ChainedCache::new(Arc::new(mem), file(), settings.auto_promote)
                    .with_metrics(metrics.clone()),
            ),
            (_, None) => return Err(Error::Internal("memory tier missing".into())),
        };

        info!(
            backend = ?settings.backend,
            cache = default.name(),
            root = %settings.file.root.display(),
            "Cache registry initialized"
        );

        Ok(Self {
            settings,
            default,
            memory,
            sub_caches: DashMap::new(),
            in_flight: DashMap::new(),
            metrics,
            registry,
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The configured default cache
    pub fn default_cache(&self) -> Arc<dyn ResponseCache<M>> {
        self.default.clone()
    }

    /// Named sub-cache of the default cache, created on first use
    pub fn sub_cache(&self, name: &str) -> Result<Arc<dyn ResponseCache<M>>> {
        if let Some(cache) = self.sub_caches.get(name) {
            return Ok(cache.clone());
        }
        let cache = self.default.create_sub_cache(name)?;
        Ok(self
            .sub_caches
            .entry(name.to_string())
            .or_insert(cache)
            .clone())
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }

    /// Metrics in the prometheus text exposition format
    pub fn gather_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Memory-tier statistics, when a memory tier is configured
    pub fn memory_stats(&self) -> Option<MemoryStats> {
        self.memory.as_ref().map(InMemoryCache::stats)
    }

    /// Read `key` from `cache`, running `fetch` and storing its result on a
    /// miss. Concurrent callers for the same cache and key share one fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        cache: &dyn ResponseCache<M>,
        key: &CacheKey,
        prefer_gzip: bool,
        fetch: F,
    ) -> Result<CacheResponse>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Fetched<M>>> + Send,
    {
        if let Some(hit) = cache.get_from_cache(key, prefer_gzip, None).await? {
            return Ok(hit);
        }

        let flight_key = format!("{}\u{0}{}", cache.name(), key);
        let lock = self
            .in_flight
            .entry(flight_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match cache.get_from_cache(key, prefer_gzip, None).await {
                Ok(Some(hit)) => {
                    debug!(cache = cache.name(), key = %key, "Served by concurrent fetch");
                    Ok(hit)
                }
                Ok(None) => match fetch().await {
                    Ok(fetched) => {
                        cache
                            .add_to_cache(
                                key,
                                fetched.response,
                                fetched.headers_to_include.as_deref(),
                                fetched.meta,
                                fetched.store_uncompressed,
                            )
                            .await
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        };

        drop(lock);
        self.in_flight
            .remove_if(&flight_key, |_, waiters| Arc::strong_count(waiters) == 1);
        result
    }

    /// Drop memoized sub-caches and log final counters
    pub fn shutdown(&self) {
        self.sub_caches.clear();
        self.in_flight.clear();
        let snapshot = self.metrics.snapshot(self.default.name());
        info!(
            cache = self.default.name(),
            hits = snapshot.hits,
            misses = snapshot.misses,
            writes = snapshot.writes,
            "Cache registry shut down"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
