//! Chained Cache
//!
//! Two-tier read-through cache: a fast `main` tier in front of a larger
//! `second` tier. Hits in the second tier are optionally promoted into main.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderName, CONTENT_ENCODING, CONTENT_LENGTH};
use http::StatusCode;
use tracing::{debug, warn};

use super::backend::ResponseCache;
use super::entry::{CacheKey, CacheMeta, MetaUpdater};
use super::metrics::CacheMetrics;
use super::response::{Body, CacheResponse};
use crate::error::Result;

/// Read-through pair of caches
pub struct ChainedCache<M> {
    main: Arc<dyn ResponseCache<M>>,
    second: Arc<dyn ResponseCache<M>>,
    auto_promote: bool,
    metrics: Option<Arc<CacheMetrics>>,
    name: String,
}

impl<M: CacheMeta> ChainedCache<M> {
    pub fn new(
        main: Arc<dyn ResponseCache<M>>,
        second: Arc<dyn ResponseCache<M>>,
        auto_promote: bool,
    ) -> Self {
        let name = format!("{}+{}", main.name(), second.name());
        Self {
            main,
            second,
            auto_promote,
            metrics: None,
            name,
        }
    }

    /// Count promotions in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn main(&self) -> &Arc<dyn ResponseCache<M>> {
        &self.main
    }

    pub fn second(&self) -> &Arc<dyn ResponseCache<M>> {
        &self.second
    }

    pub fn auto_promote(&self) -> bool {
        self.auto_promote
    }

    /// A 200 hit without a body means the second tier lost its body file.
    /// Copying it would turn that into a durable empty hit in main.
    fn promotable(&self, key: &CacheKey, hit: &CacheResponse) -> bool {
        if hit.status() == StatusCode::OK && matches!(hit.body(), Body::Empty) {
            warn!(cache = %self.name, key = %key, "Second-tier hit has no body, not promoting");
            return false;
        }
        true
    }

    /// Copy a second-tier hit into main, returning main's stored response
    async fn promote(
        &self,
        key: &CacheKey,
        response: CacheResponse,
        meta: Option<M>,
    ) -> Result<CacheResponse> {
        let is_gzipped = response.is_gzipped();
        let carried: Vec<HeaderName> = response
            .headers()
            .keys()
            .filter(|name| **name != CONTENT_ENCODING && **name != CONTENT_LENGTH)
            .cloned()
            .collect();

        let promoted = self
            .main
            .add_to_cache(key, response, Some(&carried), meta, !is_gzipped)
            .await?;

        debug!(cache = %self.name, key = %key, is_gzipped, "Promoted entry into main tier");
        if let Some(metrics) = &self.metrics {
            metrics.record_promotion(&self.name);
        }
        Ok(promoted)
    }
}

#[async_trait]
impl<M: CacheMeta> ResponseCache<M> for ChainedCache<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_from_cache(
        &self,
        key: &CacheKey,
        prefer_gzip: bool,
        meta_updater: Option<MetaUpdater<'_, M>>,
    ) -> Result<Option<CacheResponse>> {
        if let Some(hit) = self.main.get_from_cache(key, prefer_gzip, meta_updater).await? {
            return Ok(Some(hit));
        }

        let Some(hit) = self.second.get_from_cache(key, prefer_gzip, meta_updater).await? else {
            return Ok(None);
        };
        if !self.auto_promote || !self.promotable(key, &hit) {
            return Ok(Some(hit));
        }

        let meta = self.second.get_meta(key).await?;
        Ok(Some(self.promote(key, hit, meta).await?))
    }

    async fn add_to_cache(
        &self,
        key: &CacheKey,
        response: CacheResponse,
        headers_to_include: Option<&[HeaderName]>,
        meta: Option<M>,
        store_uncompressed: bool,
    ) -> Result<CacheResponse> {
        let stored = self
            .main
            .add_to_cache(key, response, headers_to_include, meta.clone(), store_uncompressed)
            .await?;
        self.second
            .add_to_cache(key, stored, headers_to_include, meta, store_uncompressed)
            .await
    }

    async fn has_in_cache(
        &self,
        key: &CacheKey,
        require_uncompressed: Option<bool>,
    ) -> Result<bool> {
        Ok(self.main.has_in_cache(key, require_uncompressed).await?
            || self.second.has_in_cache(key, require_uncompressed).await?)
    }

    async fn remove_from_cache(&self, key: &CacheKey) -> Result<()> {
        self.main.remove_from_cache(key).await?;
        self.second.remove_from_cache(key).await
    }

    async fn get_meta(&self, key: &CacheKey) -> Result<Option<M>> {
        if self.main.has_in_cache(key, None).await? {
            return self.main.get_meta(key).await;
        }

        let meta = self.second.get_meta(key).await?;
        if self.auto_promote {
            if let Some(hit) = self.second.get_from_cache(key, true, None).await? {
                if self.promotable(key, &hit) {
                    self.promote(key, hit, meta.clone()).await?;
                }
            }
        }
        Ok(meta)
    }

    fn create_sub_cache(&self, name: &str) -> Result<Arc<dyn ResponseCache<M>>> {
        let mut sub = ChainedCache::new(
            self.main.create_sub_cache(name)?,
            self.second.create_sub_cache(name)?,
            self.auto_promote,
        );
        sub.metrics = self.metrics.clone();
        Ok(Arc::new(sub))
    }
}

// =============================================================================
// Tests
// =============================================================================
