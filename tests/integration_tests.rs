//! webcache Integration Tests
//!
//! Contract behavior checked against every backend:
//! - Round-trips, status handling, existence and removal
//! - In-memory eviction settling and HTML avoidance
//! - Chained promotion
//! - Registry wiring and single-flight

use std::sync::Arc;

use http::header::{HeaderName, CONTENT_ENCODING, CONTENT_TYPE, ETAG, LOCATION};
use http::StatusCode;
use tempfile::TempDir;

use webcache::cache::{
    FileCacheConfig, GzipCompressor, InMemoryCache, JsonMeta, MemoryCacheConfig, SimpleFileCache,
};
use webcache::{CacheKey, CacheResponse, ChainedCache, ResponseCache};

type DynCache = Arc<dyn ResponseCache<JsonMeta>>;

/// One of each backend over a scratch directory
struct Backends {
    _dir: TempDir,
    caches: Vec<DynCache>,
}

fn backends() -> Backends {
    let dir = tempfile::tempdir().unwrap();
    let memory: DynCache = Arc::new(InMemoryCache::new(MemoryCacheConfig::default()));
    let file: DynCache = Arc::new(SimpleFileCache::new(FileCacheConfig::at(dir.path().join("file"))));
    let chained: DynCache = Arc::new(ChainedCache::new(
        Arc::new(InMemoryCache::<JsonMeta>::new(MemoryCacheConfig::default())),
        Arc::new(SimpleFileCache::<JsonMeta>::new(FileCacheConfig::at(dir.path().join("chained")))),
        true,
    ));
    Backends {
        _dir: dir,
        caches: vec![memory, file, chained],
    }
}

/// Body bytes with any gzip encoding removed
async fn plain_body(response: CacheResponse) -> Vec<u8> {
    let gzipped = response.is_gzipped();
    let bytes = response.bytes().await.unwrap();
    if gzipped {
        GzipCompressor::new().decompress(&bytes).unwrap().to_vec()
    } else {
        bytes.to_vec()
    }
}

// =============================================================================
// Contract Tests
// =============================================================================

mod contract_tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_every_backend() {
        let b = backends();
        for cache in &b.caches {
            for (store_uncompressed, prefer_gzip) in [(true, false), (false, true)] {
                let key = CacheKey::parse(&format!("https://x/rt-{}", store_uncompressed));
                let response = CacheResponse::ok("round trip body")
                    .with_header(CONTENT_TYPE, "text/plain")
                    .with_header(ETAG, "\"e1\"")
                    .with_header(HeaderName::from_static("x-internal"), "secret");

                cache
                    .add_to_cache(&key, response, None, None, store_uncompressed)
                    .await
                    .unwrap();
                let hit = cache.get_from_cache(&key, prefer_gzip, None).await.unwrap().unwrap();

                assert_eq!(hit.status(), StatusCode::OK, "{}", cache.name());
                assert_eq!(hit.is_gzipped(), prefer_gzip, "{}", cache.name());
                assert_eq!(hit.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
                assert_eq!(hit.headers().get(ETAG).unwrap(), "\"e1\"");
                assert!(hit.headers().get("x-internal").is_none());
                assert_eq!(plain_body(hit).await, b"round trip body");
            }
        }
    }

    #[tokio::test]
    async fn test_non_ok_never_stores_body() {
        let b = backends();
        for cache in &b.caches {
            for status in [StatusCode::NOT_FOUND, StatusCode::INTERNAL_SERVER_ERROR] {
                let key = CacheKey::parse(&format!("https://x/status-{}", status.as_u16()));
                let response = CacheResponse::new(status).with_body("error page");
                cache.add_to_cache(&key, response, None, None, true).await.unwrap();

                let hit = cache.get_from_cache(&key, false, None).await.unwrap().unwrap();
                assert_eq!(hit.status(), status);
                assert!(hit.bytes().await.unwrap().is_empty(), "{}", cache.name());
            }
        }
    }

    #[tokio::test]
    async fn test_redirect_keeps_location() {
        let b = backends();
        for cache in &b.caches {
            let key = CacheKey::parse("https://x/old-path");
            let response = CacheResponse::new(StatusCode::MOVED_PERMANENTLY)
                .with_header(LOCATION, "https://x/new-path")
                .with_header(CONTENT_TYPE, "text/html");
            cache.add_to_cache(&key, response, None, None, false).await.unwrap();

            let hit = cache.get_from_cache(&key, true, None).await.unwrap().unwrap();
            assert_eq!(hit.status(), StatusCode::MOVED_PERMANENTLY);
            assert_eq!(hit.headers().get(LOCATION).unwrap(), "https://x/new-path");
            assert!(hit.headers().get(CONTENT_TYPE).is_none());
        }
    }

    #[tokio::test]
    async fn test_has_before_and_after_write() {
        let b = backends();
        for cache in &b.caches {
            let key = CacheKey::parse("https://x/presence");
            assert!(!cache.has_in_cache(&key, None).await.unwrap());
            cache.add_to_cache(&key, CacheResponse::ok("p"), None, None, false).await.unwrap();
            assert!(cache.has_in_cache(&key, None).await.unwrap(), "{}", cache.name());
        }
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let b = backends();
        for cache in &b.caches {
            let key = CacheKey::parse("https://x/twice");
            cache.add_to_cache(&key, CacheResponse::ok("t"), None, None, true).await.unwrap();

            cache.remove_from_cache(&key).await.unwrap();
            cache.remove_from_cache(&key).await.unwrap();
            assert!(cache.get_from_cache(&key, false, None).await.unwrap().is_none());
            assert!(cache.get_from_cache(&key, true, None).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_fragment_is_not_part_of_key() {
        let b = backends();
        for cache in &b.caches {
            let written = CacheKey::parse("https://x/doc#intro");
            cache.add_to_cache(&written, CacheResponse::ok("doc"), None, None, true).await.unwrap();

            let read = CacheKey::parse("https://x/doc#usage");
            assert!(cache.has_in_cache(&read, None).await.unwrap(), "{}", cache.name());
        }
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let b = backends();
        for cache in &b.caches {
            let key = CacheKey::parse("https://x/with-meta");
            let meta = serde_json::json!({"user": "u1", "rev": 3});
            cache
                .add_to_cache(&key, CacheResponse::ok("m"), None, Some(meta.clone()), true)
                .await
                .unwrap();
            assert_eq!(cache.get_meta(&key).await.unwrap(), Some(meta));
            assert_eq!(cache.get_meta(&CacheKey::parse("https://x/none")).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_sub_caches_are_isolated() {
        let b = backends();
        for cache in &b.caches {
            let a = cache.create_sub_cache("a").unwrap();
            let other = cache.create_sub_cache("b").unwrap();
            let key = CacheKey::parse("https://x/shared-path");

            a.add_to_cache(&key, CacheResponse::ok("from a"), None, None, true).await.unwrap();
            assert!(a.has_in_cache(&key, None).await.unwrap());
            assert!(!other.has_in_cache(&key, None).await.unwrap(), "{}", cache.name());
            assert!(!cache.has_in_cache(&key, None).await.unwrap(), "{}", cache.name());
        }
    }
}

// =============================================================================
// Concrete Scenarios
// =============================================================================

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_plain_hello() {
        let cache: InMemoryCache<JsonMeta> = InMemoryCache::new(MemoryCacheConfig::default());
        let key = CacheKey::parse("https://x/a");

        cache.add_to_cache(&key, CacheResponse::ok("hello"), None, None, true).await.unwrap();
        let hit = cache.get_from_cache(&key, false, None).await.unwrap().unwrap();

        assert_eq!(hit.status(), StatusCode::OK);
        assert!(!hit.is_gzipped());
        assert_eq!(hit.bytes().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_file_three_byte_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let cache: SimpleFileCache<JsonMeta> = SimpleFileCache::new(FileCacheConfig::at(dir.path()));
        let key = CacheKey::parse("https://x/b");

        cache.add_to_cache(&key, CacheResponse::ok("xyz"), None, None, false).await.unwrap();

        let gz = cache.get_from_cache(&key, true, None).await.unwrap().unwrap();
        assert_eq!(gz.headers().get(CONTENT_ENCODING).unwrap(), "gzip");

        let plain = cache.get_from_cache(&key, false, None).await.unwrap().unwrap();
        assert!(plain.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(plain.bytes().await.unwrap().as_ref(), b"xyz");
    }
}

// =============================================================================
// In-Memory Eviction Tests
// =============================================================================

mod eviction_tests {
    use super::*;

    #[tokio::test]
    async fn test_item_count_settles() {
        let config = MemoryCacheConfig {
            max_item_count: 50,
            max_item_count_delta: 10,
            ..Default::default()
        };
        let cache: InMemoryCache<JsonMeta> = InMemoryCache::new(config);

        for i in 0..61 {
            let key = CacheKey::parse(&format!("https://x/img-{}.png", i));
            let response = CacheResponse::ok("i").with_header(CONTENT_TYPE, "image/png");
            cache.add_to_cache(&key, response, None, None, true).await.unwrap();
        }
        cache
            .get_from_cache(&CacheKey::parse("https://x/img-60.png"), false, None)
            .await
            .unwrap();

        let stats = cache.stats();
        assert!(stats.item_count <= 50, "item count {}", stats.item_count);
        assert!(stats.evictions > 0);
    }

    #[tokio::test]
    async fn test_recently_read_entries_survive() {
        let config = MemoryCacheConfig {
            max_item_count: 4,
            max_item_count_delta: 2,
            ..Default::default()
        };
        let cache: InMemoryCache<JsonMeta> = InMemoryCache::new(config);
        let keys: Vec<CacheKey> = (0..4)
            .map(|i| CacheKey::parse(&format!("https://x/{}.js", i)))
            .collect();

        for key in &keys {
            cache.add_to_cache(key, CacheResponse::ok("js"), None, None, true).await.unwrap();
        }
        // Touch the oldest entry so it is not a candidate
        cache.get_from_cache(&keys[0], false, None).await.unwrap();

        let extra = CacheKey::parse("https://x/4.js");
        cache.add_to_cache(&extra, CacheResponse::ok("js"), None, None, true).await.unwrap();

        assert!(cache.has_in_cache(&keys[0], None).await.unwrap());
        assert!(!cache.has_in_cache(&keys[1], None).await.unwrap());
        assert!(!cache.has_in_cache(&keys[2], None).await.unwrap());
        assert!(cache.has_in_cache(&extra, None).await.unwrap());
        assert_eq!(cache.stats().item_count, 2);
    }

    #[tokio::test]
    async fn test_html_survives_byte_pressure() {
        let config = MemoryCacheConfig {
            max_memory_bytes: 10_000,
            max_memory_bytes_delta: 1_000,
            ..Default::default()
        };
        let cache: InMemoryCache<JsonMeta> = InMemoryCache::new(config);

        let pages: Vec<CacheKey> = (0..3)
            .map(|i| CacheKey::parse(&format!("https://x/page-{}", i)))
            .collect();
        for key in &pages {
            let response =
                CacheResponse::ok(vec![b'h'; 2_000]).with_header(CONTENT_TYPE, "text/html; charset=utf-8");
            cache.add_to_cache(key, response, None, None, true).await.unwrap();
        }
        for i in 0..4 {
            let key = CacheKey::parse(&format!("https://x/asset-{}.bin", i));
            let response =
                CacheResponse::ok(vec![b'b'; 1_500]).with_header(CONTENT_TYPE, "application/octet-stream");
            cache.add_to_cache(&key, response, None, None, true).await.unwrap();
        }

        for key in &pages {
            assert!(cache.has_in_cache(key, None).await.unwrap());
        }
        assert!(cache.stats().memory_bytes <= 10_000);
    }
}

// =============================================================================
// Chained Cache Tests
// =============================================================================

mod chained_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_tier_hit_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let main: DynCache = Arc::new(InMemoryCache::<JsonMeta>::new(MemoryCacheConfig::default()));
        let second: DynCache = Arc::new(SimpleFileCache::<JsonMeta>::new(FileCacheConfig::at(dir.path())));
        let chain = ChainedCache::new(main.clone(), second.clone(), true);
        let key = CacheKey::parse("https://x/K");

        second.add_to_cache(&key, CacheResponse::ok("k"), None, None, false).await.unwrap();
        assert!(!main.has_in_cache(&key, None).await.unwrap());

        chain.get_from_cache(&key, false, None).await.unwrap().unwrap();
        assert!(main.has_in_cache(&key, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_tier_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::parse("https://x/durable");
        {
            let chain: ChainedCache<JsonMeta> = ChainedCache::new(
                Arc::new(InMemoryCache::new(MemoryCacheConfig::default())),
                Arc::new(SimpleFileCache::new(FileCacheConfig::at(dir.path()))),
                true,
            );
            chain.add_to_cache(&key, CacheResponse::ok("persisted"), None, None, false).await.unwrap();
        }

        // Fresh process: empty memory tier over the same directory
        let chain: ChainedCache<JsonMeta> = ChainedCache::new(
            Arc::new(InMemoryCache::new(MemoryCacheConfig::default())),
            Arc::new(SimpleFileCache::new(FileCacheConfig::at(dir.path()))),
            true,
        );
        let hit = chain.get_from_cache(&key, false, None).await.unwrap().unwrap();
        assert_eq!(hit.bytes().await.unwrap().as_ref(), b"persisted");
        assert!(chain.main().has_in_cache(&key, None).await.unwrap());
    }
}

// =============================================================================
// Registry Tests
// =============================================================================

mod registry_tests {
    use super::*;
    use webcache::cache::{BackendKind, CacheSettings, Fetched};
    use webcache::CacheRegistry;

    #[tokio::test]
    async fn test_yaml_file_to_working_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("cache.yaml");
        let yaml = format!(
            "backend: chained\nauto_promote: true\nfile:\n  root: {}\nmemory:\n  max_item_count: 100\n  max_item_count_delta: 10\n",
            dir.path().join("store").display()
        );
        std::fs::write(&config_path, yaml).unwrap();

        let settings = CacheSettings::from_yaml_file(&config_path).unwrap();
        assert_eq!(settings.backend, BackendKind::Chained);

        let registry: CacheRegistry<JsonMeta> = CacheRegistry::init(settings).await.unwrap();
        let cache = registry.default_cache();
        let key = CacheKey::parse("https://x/from-config");
        cache.add_to_cache(&key, CacheResponse::ok("cfg"), None, None, false).await.unwrap();

        assert!(dir.path().join("store").is_dir());
        assert_eq!(registry.memory_stats().unwrap().item_count, 1);

        let metrics = registry.gather_metrics().unwrap();
        assert!(metrics.contains("webcache_writes_total"));
    }

    #[tokio::test]
    async fn test_get_or_fetch_on_sub_cache() {
        let settings = CacheSettings {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let registry: CacheRegistry<JsonMeta> = CacheRegistry::init(settings).await.unwrap();
        let tenant = registry.sub_cache("tenant-1").unwrap();
        let key = CacheKey::parse("https://x/dashboard");

        let response = registry
            .get_or_fetch(tenant.as_ref(), &key, true, || async {
                Ok(Fetched::new(CacheResponse::ok("rendered")).with_meta(serde_json::json!({"v": 1})))
            })
            .await
            .unwrap();
        assert!(response.is_gzipped());
        assert_eq!(plain_body(response).await, b"rendered");

        assert!(tenant.has_in_cache(&key, None).await.unwrap());
        assert!(!registry.default_cache().has_in_cache(&key, None).await.unwrap());
        assert_eq!(tenant.get_meta(&key).await.unwrap(), Some(serde_json::json!({"v": 1})));
    }
}

// =============================================================================
// Property Tests
// =============================================================================

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_body_round_trips(
            body in proptest::collection::vec(any::<u8>(), 0..4096),
            store_uncompressed in any::<bool>(),
            prefer_gzip in any::<bool>(),
        ) {
            let b = backends();
            tokio_test::block_on(async {
                for cache in &b.caches {
                    let key = CacheKey::parse("https://x/prop");
                    cache
                        .add_to_cache(&key, CacheResponse::ok(body.clone()), None, None, store_uncompressed)
                        .await
                        .unwrap();
                    let hit = cache.get_from_cache(&key, prefer_gzip, None).await.unwrap().unwrap();
                    assert_eq!(plain_body(hit).await, body, "{}", cache.name());
                }
            });
        }
    }
}
