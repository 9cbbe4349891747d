//! Cache Entry Types
//!
//! The persisted record for one cached URL and its two codecs:
//! response → entry ([`CacheEntry::from_response`]) and
//! entry → response ([`CacheEntry::to_response`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::response::{Body, CacheResponse};

/// Headers captured for 200 responses when the caller supplies no allow-list
pub const DEFAULT_HEADERS: [HeaderName; 3] = [CONTENT_TYPE, ETAG, LAST_MODIFIED];

/// Caller-defined metadata stored next to each entry
pub trait CacheMeta: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheMeta for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Untyped metadata
pub type JsonMeta = serde_json::Value;

/// Outcome of a metadata updater run during a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaUpdate<M> {
    /// Keep the entry as is
    Unchanged,
    /// Persist new metadata without touching the body
    Updated(M),
    /// Remove the whole entry
    Delete,
}

/// Callback inspecting the current metadata of a hit
pub type MetaUpdater<'a, M> = &'a (dyn Fn(Option<&M>) -> MetaUpdate<M> + Send + Sync);

/// Cache key: a normalized URL without its fragment
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from a URL, dropping the fragment
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Derive a key from raw text. Parseable URLs are normalized; anything
    /// else is used verbatim up to the first `#`.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) => Self::from_url(&url),
            Err(_) => Self(raw.split_once('#').map_or(raw, |(k, _)| k).to_string()),
        }
    }

    /// Key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same key inside a namespace
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self(format!("{}{}", prefix, self.0))
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_status() -> u16 {
    StatusCode::OK.as_u16()
}

/// One cached response
///
/// Only `status`, `headers`, `meta` and `isGzipped` are persisted; payloads
/// and counters live in memory.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "M: CacheMeta")]
pub struct CacheEntry<M> {
    /// HTTP status; records without one default to 200
    #[serde(default = "default_status")]
    pub status: u16,
    /// Allow-listed headers, lower-case names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// Caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<M>,
    /// Whether the stored payload is the gzip representation
    #[serde(default)]
    pub is_gzipped: bool,
    /// Raw payload
    #[serde(skip)]
    pub uncompressed: Option<Bytes>,
    /// Gzip payload
    #[serde(skip)]
    pub compressed: Option<Bytes>,
    #[serde(skip)]
    ref_count: AtomicU64,
    #[serde(skip)]
    ref_count_since_gc: AtomicU64,
    /// Insertion order, for deterministic eviction
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl<M> CacheEntry<M> {
    /// Build an entry from a response's status and headers. The body is
    /// never touched.
    ///
    /// 200 responses keep the allow-listed headers (default
    /// [`DEFAULT_HEADERS`]), 3xx keep only `location`, anything else keeps
    /// none.
    pub fn from_response(
        status: StatusCode,
        headers: &HeaderMap,
        headers_to_include: Option<&[HeaderName]>,
        meta: Option<M>,
        is_gzipped: bool,
    ) -> Self {
        let captured = if status == StatusCode::OK {
            Some(capture(
                headers,
                headers_to_include.unwrap_or(&DEFAULT_HEADERS),
            ))
        } else if status.is_redirection() {
            Some(capture(headers, &[LOCATION]))
        } else {
            None
        };

        Self {
            status: status.as_u16(),
            headers: captured,
            meta,
            is_gzipped,
            uncompressed: None,
            compressed: None,
            ref_count: AtomicU64::new(0),
            ref_count_since_gc: AtomicU64::new(0),
            seq: 0,
        }
    }

    /// Attach the payload in the representation it was produced in
    pub fn with_payload(mut self, payload: Bytes, is_gzipped: bool) -> Self {
        self.is_gzipped = is_gzipped;
        if is_gzipped {
            self.compressed = Some(payload);
            self.uncompressed = None;
        } else {
            self.uncompressed = Some(payload);
            self.compressed = None;
        }
        self
    }

    /// Rebuild a response. With a body, `content-encoding: gzip` is set when
    /// `is_gzipped` and removed otherwise; without one the response carries
    /// only status and headers.
    pub fn to_response(&self, body: Option<Body>, is_gzipped: bool) -> CacheResponse {
        let response =
            CacheResponse::from_parts(self.status_code(), self.header_map(), Body::Empty);
        match body {
            Some(body) => response.with_encoded_body(body, is_gzipped),
            None => response,
        }
    }

    /// Status as a typed code
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    /// Stored headers as a header map
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.headers.iter().flatten() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.insert(name, value);
            }
        }
        map
    }

    /// Only 200 responses carry a body
    #[inline]
    pub fn has_body(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }

    /// HTML pages are the last entries to be evicted
    pub fn is_html(&self) -> bool {
        self.headers
            .as_ref()
            .and_then(|h| h.get(CONTENT_TYPE.as_str()))
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    /// Bytes held across both representations
    pub fn size(&self) -> u64 {
        let len = |b: &Option<Bytes>| b.as_ref().map_or(0, |b| b.len() as u64);
        len(&self.uncompressed) + len(&self.compressed)
    }

    /// Count a hit
    #[inline]
    pub fn record_hit(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
        self.ref_count_since_gc.fetch_add(1, Ordering::Relaxed);
    }

    /// Lifetime hit count
    #[inline]
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Hits since the last eviction pass
    #[inline]
    pub fn ref_count_since_gc(&self) -> u64 {
        self.ref_count_since_gc.load(Ordering::Relaxed)
    }

    /// Start a new observation window
    #[inline]
    pub fn reset_gc_window(&self) {
        self.ref_count_since_gc.store(0, Ordering::Relaxed);
    }
}

fn capture(headers: &HeaderMap, names: &[HeaderName]) -> BTreeMap<String, String> {
    names
        .iter()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

impl<M> fmt::Debug for CacheEntry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("is_gzipped", &self.is_gzipped)
            .field("uncompressed_size", &self.uncompressed.as_ref().map(Bytes::len))
            .field("compressed_size", &self.compressed.as_ref().map(Bytes::len))
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
