//! Lock-free metrics primitives + a small global metrics surface.
//!
//! Recording is O(1) with relaxed atomics; snapshots are plain loads and
//! serialize to JSON for the CLI.

#![forbid(unsafe_code)]

use serde::Serialize;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct GaugeU64 {
    v: AtomicU64,
}

impl GaugeU64 {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, delta: u64) {
        // Saturating: a racing reset must never wrap the gauge.
        let _ = self
            .v
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(delta))
            });
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.v.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_max(&self, value: u64) {
        self.v.fetch_max(value, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Storage metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StorageMetrics {
    /// Every `request_save` call across all queues.
    pub save_requests_total: Counter,
    /// Requests that joined an already-armed timer or an in-flight write.
    pub save_requests_coalesced_total: Counter,
    /// Save function invocations.
    pub flushes_total: Counter,
    /// Flushes triggered by a request that arrived mid-write.
    pub followup_flushes_total: Counter,
    /// Save function failures (errors and panics) routed to an error sink.
    pub save_errors_total: Counter,
    /// Keys currently not idle in any queue.
    pub active_keys: GaugeU64,
    pub peak_active_keys: GaugeU64,

    pub atomic_writes_total: Counter,
    pub atomic_write_failures_total: Counter,
    pub rename_retries_total: Counter,
    pub atomic_write_bytes_total: Counter,

    pub dir_cache_hits_total: Counter,
    pub dir_cache_misses_total: Counter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageMetricsSnapshot {
    pub save_requests_total: u64,
    pub save_requests_coalesced_total: u64,
    pub flushes_total: u64,
    pub followup_flushes_total: u64,
    pub save_errors_total: u64,
    pub active_keys: u64,
    pub peak_active_keys: u64,
    pub atomic_writes_total: u64,
    pub atomic_write_failures_total: u64,
    pub rename_retries_total: u64,
    pub atomic_write_bytes_total: u64,
    pub dir_cache_hits_total: u64,
    pub dir_cache_misses_total: u64,
}

impl StorageMetrics {
    #[must_use]
    pub fn snapshot(&self) -> StorageMetricsSnapshot {
        StorageMetricsSnapshot {
            save_requests_total: self.save_requests_total.load(),
            save_requests_coalesced_total: self.save_requests_coalesced_total.load(),
            flushes_total: self.flushes_total.load(),
            followup_flushes_total: self.followup_flushes_total.load(),
            save_errors_total: self.save_errors_total.load(),
            active_keys: self.active_keys.load(),
            peak_active_keys: self.peak_active_keys.load(),
            atomic_writes_total: self.atomic_writes_total.load(),
            atomic_write_failures_total: self.atomic_write_failures_total.load(),
            rename_retries_total: self.rename_retries_total.load(),
            atomic_write_bytes_total: self.atomic_write_bytes_total.load(),
            dir_cache_hits_total: self.dir_cache_hits_total.load(),
            dir_cache_misses_total: self.dir_cache_misses_total.load(),
        }
    }
}

// ---------------------------------------------------------------------------
// Global surface
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub storage: StorageMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetricsSnapshot {
    pub storage: StorageMetricsSnapshot,
}

impl GlobalMetrics {
    #[must_use]
    pub fn snapshot(&self) -> GlobalMetricsSnapshot {
        GlobalMetricsSnapshot {
            storage: self.storage.snapshot(),
        }
    }
}

static GLOBAL_METRICS: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
