//! Response Cache
//!
//! Interchangeable backends behind one contract ([`ResponseCache`]):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CacheRegistry                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        ChainedCache                           │
//! │   ┌───────────────────┐   miss    ┌───────────────────────┐   │
//! │   │  InMemoryCache    │ ────────▶ │  SimpleFileCache      │   │
//! │   │  item + byte      │ ◀──────── │  <root>/<h0>/<hash>   │   │
//! │   │  budgets, GC      │  promote  │  body / gz / info     │   │
//! │   └───────────────────┘           └───────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are URLs without their fragment. Only 200 responses carry a body;
//! other statuses are cached as status plus headers.

pub mod backend;
pub mod chained;
pub mod compression;
pub mod entry;
pub mod file;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod response;

pub use backend::ResponseCache;
pub use chained::ChainedCache;
pub use compression::GzipCompressor;
pub use entry::{CacheEntry, CacheKey, CacheMeta, JsonMeta, MetaUpdate, MetaUpdater, DEFAULT_HEADERS};
pub use file::{FileCacheConfig, SimpleFileCache};
pub use memory::{InMemoryCache, MemoryCacheConfig, MemoryStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use policy::{Budget, EvictionPolicy, GcReport, Usage};
pub use registry::{BackendKind, CacheRegistry, CacheSettings, Fetched};
pub use response::{Body, CacheResponse};

// =============================================================================
// Tests
// =============================================================================
