//! webcache - Response Caching Engine
//!
//! Stores, serves, invalidates and evicts HTTP-style responses keyed by URL,
//! for embedding in a web-serving framework.
//!
//! # Architecture
//!
//! ```text
//! request handler → CacheRegistry → ChainedCache → InMemoryCache
//!                                               └→ SimpleFileCache
//! ```
//!
//! # Backends
//!
//! - In-memory, bounded by item count and bytes with hysteresis eviction
//! - Content-addressed file cache with gzip bodies and JSON metadata
//! - Chained read-through of the two with promotion
//!
//! # Modules
//!
//! - [`cache`] - Cache contract, backends, registry and metrics
//! - [`error`] - Error types

pub mod cache;
pub mod error;

pub use cache::{
    CacheKey, CacheRegistry, CacheResponse, CacheSettings, ChainedCache, InMemoryCache,
    MetaUpdate, ResponseCache, SimpleFileCache,
};
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
