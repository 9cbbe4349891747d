//! Eviction Policy
//!
//! Multi-phase, deterministic eviction with hysteresis for the in-memory
//! cache. A pass starts when a budget exceeds its ceiling and evicts until
//! usage is back at `ceiling - delta`:
//!
//! 1. largest non-HTML entry, repeatedly (byte budget)
//! 2. largest entry of any type, repeatedly (byte budget)
//! 3. non-HTML entries untouched since the last pass, oldest first (item budget)
//! 4. any entry untouched since the last pass, oldest first (item budget)
//! 5. survivors start a new observation window
//!
//! A phase with no candidate simply ends; the cache may stay over budget.

use std::collections::HashMap;

use super::entry::CacheEntry;

/// A ceiling with a hysteresis band below it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Usage above this starts an eviction pass
    pub ceiling: u64,
    /// How far below the ceiling a pass evicts to
    pub delta: u64,
}

impl Budget {
    /// Create a budget
    pub fn new(ceiling: u64, delta: u64) -> Self {
        Self { ceiling, delta }
    }

    /// Whether `usage` is above the ceiling
    #[inline]
    pub fn exceeded(&self, usage: u64) -> bool {
        usage > self.ceiling
    }

    /// Usage level an eviction pass aims for
    #[inline]
    pub fn target(&self) -> u64 {
        self.ceiling.saturating_sub(self.delta)
    }
}

/// Current resource usage of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Number of entries
    pub items: u64,
    /// Payload bytes across all entries
    pub bytes: u64,
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Keys evicted, in eviction order
    pub evicted: Vec<String>,
    /// Bytes released
    pub freed_bytes: u64,
    /// Whether a budget was still exceeded after the pass
    pub over_budget: bool,
}

/// Eviction policy for the in-memory cache
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Item-count budget
    pub items: Budget,
    /// Byte budget
    pub bytes: Budget,
}

impl EvictionPolicy {
    /// Create a policy from the two budgets
    pub fn new(items: Budget, bytes: Budget) -> Self {
        Self { items, bytes }
    }

    /// Whether usage calls for an eviction pass
    pub fn needs_gc(&self, usage: Usage) -> bool {
        self.items.exceeded(usage.items) || self.bytes.exceeded(usage.bytes)
    }

    /// Run one pass over `entries`, keeping `usage` in step with removals
    pub fn run<M>(
        &self,
        entries: &mut HashMap<String, CacheEntry<M>>,
        usage: &mut Usage,
    ) -> GcReport {
        let mut report = GcReport::default();

        if self.bytes.exceeded(usage.bytes) {
            let target = self.bytes.target();
            for include_html in [false, true] {
                if usage.bytes <= target {
                    break;
                }
                let mut candidates: Vec<(u64, u64, String)> = entries
                    .iter()
                    .filter(|(_, e)| include_html || !e.is_html())
                    .map(|(k, e)| (e.size(), e.seq, k.clone()))
                    .collect();
                // Largest first; ties go to the older entry
                candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

                for (_, _, key) in candidates {
                    if usage.bytes <= target {
                        break;
                    }
                    evict(entries, usage, &key, &mut report);
                }
            }
        }

        if self.items.exceeded(usage.items) {
            let target = self.items.target();
            for include_html in [false, true] {
                if usage.items <= target {
                    break;
                }
                let mut candidates: Vec<(u64, String)> = entries
                    .iter()
                    .filter(|(_, e)| e.ref_count_since_gc() == 0)
                    .filter(|(_, e)| include_html || !e.is_html())
                    .map(|(k, e)| (e.seq, k.clone()))
                    .collect();
                candidates.sort();

                for (_, key) in candidates {
                    if usage.items <= target {
                        break;
                    }
                    evict(entries, usage, &key, &mut report);
                }
            }
        }

        for entry in entries.values() {
            entry.reset_gc_window();
        }

        report.over_budget = self.needs_gc(*usage);
        report
    }
}

fn evict<M>(
    entries: &mut HashMap<String, CacheEntry<M>>,
    usage: &mut Usage,
    key: &str,
    report: &mut GcReport,
) {
    if let Some(entry) = entries.remove(key) {
        let size = entry.size();
        usage.items = usage.items.saturating_sub(1);
        usage.bytes = usage.bytes.saturating_sub(size);
        report.freed_bytes += size;
        report.evicted.push(key.to_string());
    }
}

// =============================================================================
// Tests
// =============================================================================
