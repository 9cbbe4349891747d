//! In-Memory Cache
//!
//! Process-local cache bounded by item count and payload bytes. Writes that
//! push either budget over its ceiling run a synchronous eviction pass (see
//! [`super::policy`]) before returning.
//!
//! # Design
//!
//! - One `HashMap` behind a `parking_lot::RwLock`; reads take the read lock
//!   and bump atomic hit counters
//! - Sub-caches share the parent's store and budget; their keys are prefixed
//!   with `"<name> : "`
//! - Payloads are stored in a single representation and converted on demand

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::backend::ResponseCache;
use super::compression::GzipCompressor;
use super::entry::{CacheEntry, CacheKey, CacheMeta, MetaUpdate, MetaUpdater};
use super::metrics::CacheMetrics;
use super::policy::{Budget, EvictionPolicy, GcReport, Usage};
use super::response::{is_gzip_encoded, Body, CacheResponse};
use crate::error::Result;

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Bodies larger than this are not cached
    pub max_content_length: u64,
    /// Item-count ceiling
    pub max_item_count: u64,
    /// Hysteresis band below the item-count ceiling
    pub max_item_count_delta: u64,
    /// Byte-budget ceiling
    pub max_memory_bytes: u64,
    /// Hysteresis band below the byte-budget ceiling
    pub max_memory_bytes_delta: u64,
    /// Gzip level for compressed payloads
    pub compression_level: u32,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_content_length: 600 * 1024,
            max_item_count: 5000,
            max_item_count_delta: 500,
            max_memory_bytes: 500 * 1024 * 1024,
            max_memory_bytes_delta: 50 * 1024 * 1024,
            compression_level: 6,
        }
    }
}

impl MemoryCacheConfig {
    /// Eviction policy derived from the budgets
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(
            Budget::new(self.max_item_count, self.max_item_count_delta),
            Budget::new(self.max_memory_bytes, self.max_memory_bytes_delta),
        )
    }
}

/// Point-in-time store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Entries held, across all sub-caches
    pub item_count: u64,
    /// Payload bytes held, across all sub-caches
    pub memory_bytes: u64,
    /// Eviction passes run so far
    pub gc_runs: u64,
    /// Entries evicted so far
    pub evictions: u64,
}

struct StoreState<M> {
    entries: HashMap<String, CacheEntry<M>>,
    usage: Usage,
    next_seq: u64,
    gc_runs: u64,
    evictions: u64,
}

/// Storage shared by a cache and all of its sub-caches
struct MemoryStore<M> {
    state: RwLock<StoreState<M>>,
    config: MemoryCacheConfig,
    policy: EvictionPolicy,
    gzip: GzipCompressor,
    metrics: Option<Arc<CacheMetrics>>,
    name: String,
}

impl<M> MemoryStore<M> {
    fn insert(&self, key: String, mut entry: CacheEntry<M>) {
        let report = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            state.next_seq += 1;
            entry.seq = state.next_seq;
            let size = entry.size();

            if let Some(old) = state.entries.insert(key, entry) {
                state.usage.items = state.usage.items.saturating_sub(1);
                state.usage.bytes = state.usage.bytes.saturating_sub(old.size());
            }
            state.usage.items += 1;
            state.usage.bytes += size;

            if self.policy.needs_gc(state.usage) {
                Some(self.collect(state))
            } else {
                None
            }
        };

        if let Some(report) = report {
            self.log_gc(&report);
        }
        self.publish_usage();
    }

    fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            match state.entries.remove(key) {
                Some(old) => {
                    state.usage.items = state.usage.items.saturating_sub(1);
                    state.usage.bytes = state.usage.bytes.saturating_sub(old.size());
                    true
                }
                None => false,
            }
        };
        if removed {
            self.publish_usage();
        }
        removed
    }

    /// Runs with the write lock held; never yields
    fn collect(&self, state: &mut StoreState<M>) -> GcReport {
        let report = self.policy.run(&mut state.entries, &mut state.usage);
        state.gc_runs += 1;
        state.evictions += report.evicted.len() as u64;
        report
    }

    fn log_gc(&self, report: &GcReport) {
        debug!(
            cache = %self.name,
            evicted = report.evicted.len(),
            freed_bytes = report.freed_bytes,
            "Eviction pass finished"
        );
        if report.over_budget {
            warn!(cache = %self.name, "Cache still over budget after eviction pass");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_evictions(&self.name, report.evicted.len() as u64);
        }
    }

    fn publish_usage(&self) {
        if let Some(metrics) = &self.metrics {
            let usage = self.state.read().usage;
            metrics.update_usage(&self.name, usage.items, usage.bytes);
        }
    }
}

/// Process-local response cache
pub struct InMemoryCache<M> {
    store: Arc<MemoryStore<M>>,
    prefix: String,
    name: String,
}

impl<M> Clone for InMemoryCache<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            name: self.name.clone(),
        }
    }
}

impl<M: CacheMeta> InMemoryCache<M> {
    /// Create a cache named `memory` without metrics
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self::with_options("memory", config, None)
    }

    /// Create a cache with a name and optional metrics sink
    pub fn with_options(
        name: impl Into<String>,
        config: MemoryCacheConfig,
        metrics: Option<Arc<CacheMetrics>>,
    ) -> Self {
        let name = name.into();
        let store = MemoryStore {
            state: RwLock::new(StoreState {
                entries: HashMap::new(),
                usage: Usage::default(),
                next_seq: 0,
                gc_runs: 0,
                evictions: 0,
            }),
            policy: config.policy(),
            gzip: GzipCompressor::with_level(config.compression_level),
            config,
            metrics,
            name: name.clone(),
        };
        Self {
            store: Arc::new(store),
            prefix: String::new(),
            name,
        }
    }

    /// Store-wide statistics, shared with every sub-cache
    pub fn stats(&self) -> MemoryStats {
        let state = self.store.state.read();
        MemoryStats {
            item_count: state.usage.items,
            memory_bytes: state.usage.bytes,
            gc_runs: state.gc_runs,
            evictions: state.evictions,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.store.config
    }

    /// Run an eviction pass now, regardless of usage
    pub fn collect_garbage(&self) -> GcReport {
        let report = {
            let mut guard = self.store.state.write();
            self.store.collect(&mut guard)
        };
        self.store.log_gc(&report);
        self.store.publish_usage();
        report
    }

    /// Drop every entry in the shared store
    pub fn clear(&self) {
        {
            let mut state = self.store.state.write();
            state.entries.clear();
            state.usage = Usage::default();
        }
        self.store.publish_usage();
    }

    fn storage_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.as_str())
    }

    fn record_hit(&self) {
        if let Some(metrics) = &self.store.metrics {
            metrics.record_hit(&self.name);
        }
    }

    fn record_miss(&self) {
        if let Some(metrics) = &self.store.metrics {
            metrics.record_miss(&self.name);
        }
    }

    fn reject(&self, key: &str, size: u64) {
        warn!(
            cache = %self.name,
            key,
            size,
            limit = self.store.config.max_content_length,
            "Response too large to cache"
        );
        if let Some(metrics) = &self.store.metrics {
            metrics.record_rejected_write(&self.name);
        }
    }

    /// Apply a meta updater. Returns false when the entry is gone.
    fn apply_meta_update(&self, key: &str, updater: MetaUpdater<'_, M>) -> bool {
        let current = match self.store.state.read().entries.get(key) {
            Some(entry) => entry.meta.clone(),
            None => return false,
        };

        match updater(current.as_ref()) {
            MetaUpdate::Unchanged => true,
            MetaUpdate::Updated(meta) => {
                let mut state = self.store.state.write();
                match state.entries.get_mut(key) {
                    Some(entry) => {
                        entry.meta = Some(meta);
                        true
                    }
                    None => false,
                }
            }
            MetaUpdate::Delete => {
                debug!(cache = %self.name, key, "Entry deleted by meta updater");
                self.store.remove(key);
                false
            }
        }
    }
}

/// Payload picked for a read, cloned out from under the lock
enum Selection {
    Headers,
    Ready(Bytes, bool),
    Decompress(Bytes),
}

#[async_trait]
impl<M: CacheMeta> ResponseCache<M> for InMemoryCache<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_from_cache(
        &self,
        key: &CacheKey,
        prefer_gzip: bool,
        meta_updater: Option<MetaUpdater<'_, M>>,
    ) -> Result<Option<CacheResponse>> {
        let key = self.storage_key(key);

        if let Some(updater) = meta_updater {
            if !self.apply_meta_update(&key, updater) {
                self.record_miss();
                return Ok(None);
            }
        }

        let (head, selection) = {
            let state = self.store.state.read();
            let Some(entry) = state.entries.get(&key) else {
                self.record_miss();
                return Ok(None);
            };
            entry.record_hit();

            let selection = if !entry.has_body() {
                Selection::Headers
            } else {
                match (prefer_gzip, &entry.compressed, &entry.uncompressed) {
                    (true, Some(gz), _) => Selection::Ready(gz.clone(), true),
                    (_, _, Some(plain)) => Selection::Ready(plain.clone(), false),
                    (false, Some(gz), None) => Selection::Decompress(gz.clone()),
                    (_, None, None) => Selection::Headers,
                }
            };
            (entry.to_response(None, false), selection)
        };
        self.record_hit();

        let response = match selection {
            Selection::Headers => head,
            Selection::Ready(payload, gz) => head.with_encoded_body(payload, gz),
            Selection::Decompress(gz) => match self.store.gzip.decompress_async(gz).await {
                Ok(plain) => head.with_encoded_body(plain, false),
                Err(e) => {
                    warn!(cache = %self.name, key = %key, error = %e, "Dropping unreadable entry");
                    self.store.remove(&key);
                    return Ok(None);
                }
            },
        };
        Ok(Some(response))
    }

    async fn add_to_cache(
        &self,
        key: &CacheKey,
        response: CacheResponse,
        headers_to_include: Option<&[HeaderName]>,
        meta: Option<M>,
        store_uncompressed: bool,
    ) -> Result<CacheResponse> {
        let key = self.storage_key(key);
        let limit = self.store.config.max_content_length;

        if let Some(declared) = response.content_length() {
            if declared > limit {
                self.reject(&key, declared);
                return Ok(response);
            }
        }

        let (status, headers, body) = response.into_parts();

        if status != StatusCode::OK {
            let entry = CacheEntry::from_response(status, &headers, headers_to_include, meta, false);
            self.store.insert(key, entry);
            if let Some(metrics) = &self.store.metrics {
                metrics.record_write(&self.name);
            }
            return Ok(CacheResponse::from_parts(status, headers, body));
        }

        let incoming_gzip = is_gzip_encoded(&headers);
        let data = body.into_bytes().await?;
        if data.len() as u64 > limit {
            self.reject(&key, data.len() as u64);
            return Ok(CacheResponse::from_parts(status, headers, Body::Full(data)));
        }

        let gzip = &self.store.gzip;
        let (payload, is_gzipped) = match (store_uncompressed, incoming_gzip) {
            (true, false) | (false, true) => (data, incoming_gzip),
            (true, true) => match gzip.decompress_limited_async(data.clone(), limit).await? {
                Some(plain) => (plain, false),
                None => {
                    // Decoded size is unknown beyond the limit
                    self.reject(&key, limit.saturating_add(1));
                    return Ok(CacheResponse::from_parts(status, headers, Body::Full(data)));
                }
            },
            (false, false) => (gzip.compress_async(data).await?, true),
        };

        let entry = CacheEntry::from_response(status, &headers, headers_to_include, meta, is_gzipped)
            .with_payload(payload.clone(), is_gzipped);
        let stored = entry.to_response(Some(Body::Full(payload)), is_gzipped);
        self.store.insert(key, entry);
        if let Some(metrics) = &self.store.metrics {
            metrics.record_write(&self.name);
        }

        Ok(stored)
    }

    async fn has_in_cache(
        &self,
        key: &CacheKey,
        require_uncompressed: Option<bool>,
    ) -> Result<bool> {
        let key = self.storage_key(key);
        let state = self.store.state.read();
        Ok(match (state.entries.get(&key), require_uncompressed) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(entry), Some(true)) => entry.uncompressed.is_some(),
            (Some(entry), Some(false)) => entry.compressed.is_some(),
        })
    }

    async fn remove_from_cache(&self, key: &CacheKey) -> Result<()> {
        self.store.remove(&self.storage_key(key));
        Ok(())
    }

    async fn get_meta(&self, key: &CacheKey) -> Result<Option<M>> {
        let key = self.storage_key(key);
        let state = self.store.state.read();
        Ok(state.entries.get(&key).and_then(|e| e.meta.clone()))
    }

    fn create_sub_cache(&self, name: &str) -> Result<Arc<dyn ResponseCache<M>>> {
        Ok(Arc::new(Self {
            store: self.store.clone(),
            prefix: format!("{}{} : ", self.prefix, name),
            name: format!("{}/{}", self.name, name),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
