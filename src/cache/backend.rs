//! Cache Contract
//!
//! The operation set every backend implements. Misses are `Ok(None)`, never
//! errors.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::HeaderName;

use super::entry::{CacheKey, CacheMeta, MetaUpdater};
use super::response::CacheResponse;
use crate::error::Result;

/// A response cache backend
#[async_trait]
pub trait ResponseCache<M: CacheMeta>: Send + Sync {
    /// Backend name, used for logs and metric labels
    fn name(&self) -> &str;

    /// Look up `key`.
    ///
    /// The payload representation follows `prefer_gzip`, falling back to the
    /// other one when the preferred copy is absent. The returned response
    /// carries `content-encoding: gzip` exactly when it is gzip-encoded.
    /// A `meta_updater` may rewrite the metadata or delete the entry as a
    /// side effect of the read.
    async fn get_from_cache(
        &self,
        key: &CacheKey,
        prefer_gzip: bool,
        meta_updater: Option<MetaUpdater<'_, M>>,
    ) -> Result<Option<CacheResponse>>;

    /// Store `response` under `key` and return a fresh response backed by
    /// the stored representation.
    ///
    /// Metadata is always stored; the body only for status 200.
    async fn add_to_cache(
        &self,
        key: &CacheKey,
        response: CacheResponse,
        headers_to_include: Option<&[HeaderName]>,
        meta: Option<M>,
        store_uncompressed: bool,
    ) -> Result<CacheResponse>;

    /// Existence check. `Some(true)`/`Some(false)` require the uncompressed
    /// or the gzip representation respectively.
    async fn has_in_cache(&self, key: &CacheKey, require_uncompressed: Option<bool>)
        -> Result<bool>;

    /// Remove every representation of `key`. Idempotent.
    async fn remove_from_cache(&self, key: &CacheKey) -> Result<()>;

    /// Metadata-only read
    async fn get_meta(&self, key: &CacheKey) -> Result<Option<M>>;

    /// Namespaced view of this cache
    fn create_sub_cache(&self, name: &str) -> Result<Arc<dyn ResponseCache<M>>>;
}
