//! Cache Metrics Collection
//!
//! Prometheus counters and gauges labelled by cache name. Metrics are created
//! unregistered and attached to an explicit [`Registry`] by their owner.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::Result;

const NAMESPACE: &str = "webcache";
const LABELS: &[&str] = &["cache"];

/// Cache metrics collector
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    hits: IntCounterVec,
    misses: IntCounterVec,
    writes: IntCounterVec,
    rejected_writes: IntCounterVec,
    evictions: IntCounterVec,
    promotions: IntCounterVec,
    items: IntGaugeVec,
    memory_bytes: IntGaugeVec,
}

impl CacheMetrics {
    /// Create a new, unregistered metrics collector
    pub fn new() -> Result<Self> {
        Ok(Self {
            hits: counter("hits_total", "Cache lookups that found an entry")?,
            misses: counter("misses_total", "Cache lookups that found nothing")?,
            writes: counter("writes_total", "Responses stored")?,
            rejected_writes: counter(
                "rejected_writes_total",
                "Writes skipped because the body exceeded the size limit",
            )?,
            evictions: counter("evictions_total", "Entries removed by eviction passes")?,
            promotions: counter(
                "promotions_total",
                "Entries copied from a lower tier into the preferred tier",
            )?,
            items: gauge("items", "Entries currently held")?,
            memory_bytes: gauge("memory_bytes", "Payload bytes currently held in memory")?,
        })
    }

    /// Register every metric with `registry`
    pub fn register(&self, registry: &Registry) -> Result<()> {
        for c in [
            &self.hits,
            &self.misses,
            &self.writes,
            &self.rejected_writes,
            &self.evictions,
            &self.promotions,
        ] {
            registry.register(Box::new(c.clone()))?;
        }
        registry.register(Box::new(self.items.clone()))?;
        registry.register(Box::new(self.memory_bytes.clone()))?;
        Ok(())
    }

    pub fn record_hit(&self, cache: &str) {
        self.hits.with_label_values(&[cache]).inc();
    }

    pub fn record_miss(&self, cache: &str) {
        self.misses.with_label_values(&[cache]).inc();
    }

    pub fn record_write(&self, cache: &str) {
        self.writes.with_label_values(&[cache]).inc();
    }

    pub fn record_rejected_write(&self, cache: &str) {
        self.rejected_writes.with_label_values(&[cache]).inc();
    }

    pub fn record_evictions(&self, cache: &str, count: u64) {
        self.evictions.with_label_values(&[cache]).inc_by(count);
    }

    pub fn record_promotion(&self, cache: &str) {
        self.promotions.with_label_values(&[cache]).inc();
    }

    pub fn update_usage(&self, cache: &str, items: u64, bytes: u64) {
        self.items
            .with_label_values(&[cache])
            .set(i64::try_from(items).unwrap_or(i64::MAX));
        self.memory_bytes
            .with_label_values(&[cache])
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }

    /// Point-in-time view of one cache's metrics
    pub fn snapshot(&self, cache: &str) -> MetricsSnapshot {
        let hits = self.hits.with_label_values(&[cache]).get();
        let misses = self.misses.with_label_values(&[cache]).get();
        let total = hits + misses;
        MetricsSnapshot {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            writes: self.writes.with_label_values(&[cache]).get(),
            rejected_writes: self.rejected_writes.with_label_values(&[cache]).get(),
            evictions: self.evictions.with_label_values(&[cache]).get(),
            promotions: self.promotions.with_label_values(&[cache]).get(),
            items: self.items.with_label_values(&[cache]).get().max(0) as u64,
            memory_bytes: self.memory_bytes.with_label_values(&[cache]).get().max(0) as u64,
        }
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounterVec> {
    Ok(IntCounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        LABELS,
    )?)
}

fn gauge(name: &str, help: &str) -> Result<IntGaugeVec> {
    Ok(IntGaugeVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        LABELS,
    )?)
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub items: u64,
    pub memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_counters_are_per_cache() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.record_hit("memory");
        metrics.record_hit("memory");
        metrics.record_miss("memory");
        metrics.record_miss("file");

        let memory = metrics.snapshot("memory");
        assert_eq!(memory.hits, 2);
        assert_eq!(memory.misses, 1);
        assert!((memory.hit_ratio - 2.0 / 3.0).abs() < f64::EPSILON);

        let file = metrics.snapshot("file");
        assert_eq!(file.hits, 0);
        assert_eq!(file.hit_ratio, 0.0);
    }

    #[test]
    fn test_usage_gauges() {
        let metrics = CacheMetrics::new().unwrap();
        metrics.update_usage("memory", 3, 1024);
        metrics.record_evictions("memory", 2);

        let snap = metrics.snapshot("memory");
        assert_eq!(snap.items, 3);
        assert_eq!(snap.memory_bytes, 1024);
        assert_eq!(snap.evictions, 2);
    }

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = CacheMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        metrics.record_write("memory");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("webcache_writes_total{cache=\"memory\"} 1"));

        // Registering twice is rejected by prometheus
        assert!(metrics.register(&registry).is_err());
    }
}
