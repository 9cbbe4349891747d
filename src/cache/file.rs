//! Simple File Cache
//!
//! Content-addressed on-disk cache. Each key maps to three sibling files:
//!
//! ```text
//! <root>/<h0>/<hash>        uncompressed body
//! <root>/<h0>/<hash> gz     gzip body
//! <root>/<h0>/<hash> info   JSON metadata (status, headers, meta, isGzipped)
//! ```
//!
//! `<hash>` is the 16-digit lower-case hex XxHash64 of the key and `<h0>` its
//! first character. Exactly one body file is kept per entry.
//!
//! # Write ordering
//!
//! The body is streamed to a temporary file, converted file-to-file when the
//! stored encoding differs from the incoming one, and renamed into place. The
//! info file is written the same way. The info file is renamed last, so a reader never sees
//! new metadata pointing at a body that has not landed yet. A body that
//! vanishes under a reader (concurrent removal) is served as status and
//! headers only.

use std::hash::Hasher;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use http::header::HeaderName;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use twox_hash::XxHash64;
use uuid::Uuid;

use super::backend::ResponseCache;
use super::compression::GzipCompressor;
use super::entry::{CacheEntry, CacheKey, CacheMeta, MetaUpdate, MetaUpdater};
use super::metrics::CacheMetrics;
use super::response::{is_gzip_encoded, Body, CacheResponse};
use crate::error::{Error, Result};

/// Directory holding sub-cache roots
pub const SUB_CACHE_DIR: &str = "_subCaches";

const GZ_SUFFIX: &str = " gz";
const INFO_SUFFIX: &str = " info";

/// File cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCacheConfig {
    /// Cache root directory
    pub root: PathBuf,
    /// Gzip level for compressed bodies
    pub compression_level: u32,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/webcache"),
            compression_level: 6,
        }
    }
}

impl FileCacheConfig {
    /// Default settings rooted at `root`
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// The three files backing one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub body: PathBuf,
    pub gz: PathBuf,
    pub info: PathBuf,
}

/// On-disk response cache
pub struct SimpleFileCache<M> {
    config: FileCacheConfig,
    gzip: GzipCompressor,
    metrics: Option<Arc<CacheMetrics>>,
    name: String,
    _meta: PhantomData<fn() -> M>,
}

impl<M: CacheMeta> SimpleFileCache<M> {
    /// Create a cache named `file` without metrics. Directories are created
    /// on first write.
    pub fn new(config: FileCacheConfig) -> Self {
        Self::with_options("file", config, None)
    }

    /// Create a cache with a name and optional metrics sink
    pub fn with_options(
        name: impl Into<String>,
        config: FileCacheConfig,
        metrics: Option<Arc<CacheMetrics>>,
    ) -> Self {
        Self {
            gzip: GzipCompressor::with_level(config.compression_level),
            config,
            metrics,
            name: name.into(),
            _meta: PhantomData,
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Files backing `key`
    pub fn entry_paths(&self, key: &CacheKey) -> EntryPaths {
        let hash = hash_key(key.as_str());
        let body = self.config.root.join(&hash[..1]).join(&hash);
        EntryPaths {
            gz: body.with_file_name(format!("{}{}", hash, GZ_SUFFIX)),
            info: body.with_file_name(format!("{}{}", hash, INFO_SUFFIX)),
            body,
        }
    }

    /// Load the info file. Missing or malformed metadata reads as `None`.
    async fn read_entry(&self, paths: &EntryPaths) -> Result<Option<CacheEntry<M>>> {
        let raw = match fs::read(&paths.info).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                debug!(cache = %self.name, path = %paths.info.display(), error = %e, "Ignoring malformed info file");
                Ok(None)
            }
        }
    }

    async fn write_info(&self, paths: &EntryPaths, entry: &CacheEntry<M>) -> Result<()> {
        let json = serde_json::to_vec(entry)?;
        write_atomic(&paths.info, &json).await
    }

    async fn remove_paths(&self, paths: &EntryPaths) -> Result<()> {
        remove_if_exists(&paths.info).await?;
        remove_if_exists(&paths.body).await?;
        remove_if_exists(&paths.gz).await
    }

    /// Open a body file for streaming; `None` when it is gone
    async fn open_body(&self, path: &Path) -> Result<Option<Body>> {
        match fs::File::open(path).await {
            Ok(file) => Ok(Some(Body::from_file(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record_hit(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_hit(&self.name);
        }
    }

    fn record_miss(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_miss(&self.name);
        }
    }

    fn record_write(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_write(&self.name);
        }
    }
}

/// Hex XxHash64 of a key; directory keys hash as their `index.html`
pub fn hash_key(key: &str) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    if key.ends_with('/') {
        hasher.write(b"index.html");
    }
    format!("{:016x}", hasher.finish())
}

/// Reject sub-cache names that would escape `_subCaches/`
fn check_sub_cache_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." {
        "name is a reserved path component"
    } else if name.contains(['/', '\\', '\0']) {
        "name contains a path separator"
    } else {
        return Ok(());
    };
    Err(Error::InvalidSubCacheName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Hidden temporary sibling of `path`
fn temp_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(".{}.tmp", Uuid::new_v4()))
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Rename a finished temporary into place, dropping it on failure
async fn commit(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(e) = fs::rename(tmp, path).await {
        let _ = fs::remove_file(tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Write `data` to a temporary sibling of `path`, then rename it into place
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    create_parent(path).await?;
    let tmp = temp_path(path);
    fs::write(&tmp, data).await?;
    commit(&tmp, path).await
}

/// Copy a body into `path` chunk by chunk. Returns the bytes written.
async fn spool(body: Body, path: &Path) -> Result<u64> {
    let mut file = fs::File::create(path).await?;
    let mut written = 0u64;
    match body {
        Body::Empty => {}
        Body::Full(bytes) => {
            file.write_all(&bytes).await?;
            written = bytes.len() as u64;
        }
        Body::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::Body(e.to_string()))?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
        }
    }
    file.flush().await?;
    Ok(written)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn exists(path: &Path) -> Result<bool> {
    Ok(fs::try_exists(path).await?)
}

#[async_trait]
impl<M: CacheMeta> ResponseCache<M> for SimpleFileCache<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_from_cache(
        &self,
        key: &CacheKey,
        prefer_gzip: bool,
        meta_updater: Option<MetaUpdater<'_, M>>,
    ) -> Result<Option<CacheResponse>> {
        let paths = self.entry_paths(key);
        let Some(mut entry) = self.read_entry(&paths).await? else {
            debug!(cache = %self.name, key = %key, "Cache miss");
            self.record_miss();
            return Ok(None);
        };

        if let Some(updater) = meta_updater {
            match updater(entry.meta.as_ref()) {
                MetaUpdate::Unchanged => {}
                MetaUpdate::Updated(meta) => {
                    entry.meta = Some(meta);
                    self.write_info(&paths, &entry).await?;
                }
                MetaUpdate::Delete => {
                    debug!(cache = %self.name, key = %key, "Entry deleted by meta updater");
                    self.remove_paths(&paths).await?;
                    self.record_miss();
                    return Ok(None);
                }
            }
        }

        if !entry.has_body() {
            self.record_hit();
            return Ok(Some(entry.to_response(None, false)));
        }

        let body = if !entry.is_gzipped {
            self.open_body(&paths.body).await?.map(|b| (b, false))
        } else if prefer_gzip {
            self.open_body(&paths.gz).await?.map(|b| (b, true))
        } else {
            match self.gzip.decompress_file(&paths.gz).await {
                Ok(plain) => Some((Body::Full(plain), false)),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!(cache = %self.name, key = %key, error = %e, "Unreadable gzip body, treating as miss");
                    self.record_miss();
                    return Ok(None);
                }
            }
        };

        self.record_hit();
        Ok(Some(match body {
            Some((body, is_gzipped)) => entry.to_response(Some(body), is_gzipped),
            None => {
                warn!(cache = %self.name, key = %key, "Body file missing, serving headers only");
                entry.to_response(None, false)
            }
        }))
    }

    async fn add_to_cache(
        &self,
        key: &CacheKey,
        response: CacheResponse,
        headers_to_include: Option<&[HeaderName]>,
        meta: Option<M>,
        store_uncompressed: bool,
    ) -> Result<CacheResponse> {
        let paths = self.entry_paths(key);
        let (status, headers, body) = response.into_parts();

        if status != StatusCode::OK {
            let entry = CacheEntry::from_response(status, &headers, headers_to_include, meta, false);
            self.write_info(&paths, &entry).await?;
            remove_if_exists(&paths.body).await?;
            remove_if_exists(&paths.gz).await?;
            self.record_write();
            return Ok(CacheResponse::from_parts(status, headers, body));
        }

        let incoming_gzip = is_gzip_encoded(&headers);
        let is_gzipped = !store_uncompressed;
        let (target, stale) = if is_gzipped {
            (&paths.gz, &paths.body)
        } else {
            (&paths.body, &paths.gz)
        };

        create_parent(target).await?;
        let spooled = temp_path(target);
        let mut size = match spool(body, &spooled).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&spooled).await;
                return Err(e);
            }
        };

        let staged = if incoming_gzip == is_gzipped {
            spooled
        } else {
            let converted = temp_path(target);
            let result = if is_gzipped {
                self.gzip.compress_file(&spooled, &converted).await
            } else {
                self.gzip.decompress_file_into(&spooled, &converted).await
            };
            let _ = fs::remove_file(&spooled).await;
            match result {
                Ok(written) => size = written,
                Err(e) => {
                    let _ = fs::remove_file(&converted).await;
                    return Err(e);
                }
            }
            converted
        };
        commit(&staged, target).await?;

        let entry = CacheEntry::from_response(status, &headers, headers_to_include, meta, is_gzipped);
        self.write_info(&paths, &entry).await?;
        remove_if_exists(stale).await?;

        debug!(cache = %self.name, key = %key, size, is_gzipped, "Stored response");
        self.record_write();

        match self.open_body(target).await? {
            Some(body) => Ok(entry.to_response(Some(body), is_gzipped)),
            None => {
                warn!(cache = %self.name, key = %key, "Body removed right after write, returning headers only");
                Ok(entry.to_response(None, false))
            }
        }
    }

    async fn has_in_cache(
        &self,
        key: &CacheKey,
        require_uncompressed: Option<bool>,
    ) -> Result<bool> {
        let paths = self.entry_paths(key);
        if !exists(&paths.info).await? {
            return Ok(false);
        }
        match require_uncompressed {
            None => Ok(true),
            Some(true) => exists(&paths.body).await,
            Some(false) => exists(&paths.gz).await,
        }
    }

    async fn remove_from_cache(&self, key: &CacheKey) -> Result<()> {
        self.remove_paths(&self.entry_paths(key)).await
    }

    async fn get_meta(&self, key: &CacheKey) -> Result<Option<M>> {
        let paths = self.entry_paths(key);
        Ok(self.read_entry(&paths).await?.and_then(|e| e.meta))
    }

    fn create_sub_cache(&self, name: &str) -> Result<Arc<dyn ResponseCache<M>>> {
        check_sub_cache_name(name)?;
        let root = self.config.root.join(SUB_CACHE_DIR).join(name);
        let config = FileCacheConfig {
            root,
            ..self.config.clone()
        };
        Ok(Arc::new(Self::with_options(
            format!("{}/{}", self.name, name),
            config,
            self.metrics.clone(),
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================
