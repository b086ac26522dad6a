//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const ALLOCATIONS: &str = "imx_physmem_allocations";
const FREES: &str = "imx_physmem_frees";
const ALLOC_FAILURES: &str = "imx_physmem_alloc_failures";
const FREE_FAILURES: &str = "imx_physmem_free_failures";
const MAP_SYSCALLS: &str = "imx_physmem_map_syscalls";
const UNMAP_SYSCALLS: &str = "imx_physmem_unmap_syscalls";
const MAP_FAILURES: &str = "imx_physmem_map_failures";
const UNMAP_FAILURES: &str = "imx_physmem_unmap_failures";
const LIVE_BYTES: &str = "imx_physmem_live_bytes";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(ALLOCATIONS, Unit::Count, "Successful physical memory allocations");
    metrics::describe_counter!(FREES, Unit::Count, "Successful physical memory releases");
    metrics::describe_counter!(ALLOC_FAILURES, Unit::Count, "Allocation requests rejected");
    metrics::describe_counter!(FREE_FAILURES, Unit::Count, "Release requests rejected");
    metrics::describe_counter!(MAP_SYSCALLS, Unit::Count, "Underlying mmap calls issued");
    metrics::describe_counter!(UNMAP_SYSCALLS, Unit::Count, "Underlying munmap calls issued");
    metrics::describe_counter!(MAP_FAILURES, Unit::Count, "Underlying mmap calls that failed");
    metrics::describe_counter!(UNMAP_FAILURES, Unit::Count, "Underlying munmap calls that failed");
    metrics::describe_gauge!(LIVE_BYTES, Unit::Bytes, "Physical memory currently allocated");
}

/// Point-in-time copy of an allocator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful frees.
    pub frees: u64,
    /// Rejected allocations.
    pub alloc_failures: u64,
    /// Rejected frees.
    pub free_failures: u64,
    /// Underlying map calls, failed ones included.
    pub map_syscalls: u64,
    /// Underlying unmap calls, failed ones included.
    pub unmap_syscalls: u64,
    /// Failed map calls.
    pub map_failures: u64,
    /// Failed unmap calls.
    pub unmap_failures: u64,
    /// Bytes currently allocated.
    pub live_bytes: u64,
}

/// Counters for one allocator.
///
/// Every event is counted twice: in process-local atomics readable through
/// [`snapshot`](Self::snapshot), and in the global metrics recorder (a no-op
/// when none is installed), labelled with the allocator's memory type.
pub struct AllocatorMetrics {
    mem_type: &'static str,
    allocations: AtomicU64,
    frees: AtomicU64,
    alloc_failures: AtomicU64,
    free_failures: AtomicU64,
    map_syscalls: AtomicU64,
    unmap_syscalls: AtomicU64,
    map_failures: AtomicU64,
    unmap_failures: AtomicU64,
    live_bytes: AtomicU64,
    allocations_counter: Counter,
    frees_counter: Counter,
    alloc_failures_counter: Counter,
    free_failures_counter: Counter,
    map_syscalls_counter: Counter,
    unmap_syscalls_counter: Counter,
    map_failures_counter: Counter,
    unmap_failures_counter: Counter,
    live_bytes_gauge: Gauge,
}

impl AllocatorMetrics {
    /// Create a metrics collector for allocators of `mem_type`.
    pub fn new(mem_type: &'static str) -> Self {
        Self {
            mem_type,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            alloc_failures: AtomicU64::new(0),
            free_failures: AtomicU64::new(0),
            map_syscalls: AtomicU64::new(0),
            unmap_syscalls: AtomicU64::new(0),
            map_failures: AtomicU64::new(0),
            unmap_failures: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            allocations_counter: counter!(ALLOCATIONS, "mem_type" => mem_type),
            frees_counter: counter!(FREES, "mem_type" => mem_type),
            alloc_failures_counter: counter!(ALLOC_FAILURES, "mem_type" => mem_type),
            free_failures_counter: counter!(FREE_FAILURES, "mem_type" => mem_type),
            map_syscalls_counter: counter!(MAP_SYSCALLS, "mem_type" => mem_type),
            unmap_syscalls_counter: counter!(UNMAP_SYSCALLS, "mem_type" => mem_type),
            map_failures_counter: counter!(MAP_FAILURES, "mem_type" => mem_type),
            unmap_failures_counter: counter!(UNMAP_FAILURES, "mem_type" => mem_type),
            live_bytes_gauge: gauge!(LIVE_BYTES, "mem_type" => mem_type),
        }
    }

    /// Record a successful allocation of `bytes`.
    #[inline]
    pub fn record_allocation(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.allocations_counter.increment(1);
        let live = self.live_bytes.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.live_bytes_gauge.set(live as f64);
    }

    /// Record a successful release of `bytes`.
    #[inline]
    pub fn record_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.frees_counter.increment(1);
        self.release_bytes(bytes);
    }

    /// Record a rejected allocation.
    #[inline]
    pub fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
        self.alloc_failures_counter.increment(1);
    }

    /// Record a rejected release of `bytes`.
    ///
    /// The bytes no longer count as live: the allocator has given up on them.
    #[inline]
    pub fn record_free_failure(&self, bytes: usize) {
        self.free_failures.fetch_add(1, Ordering::Relaxed);
        self.free_failures_counter.increment(1);
        self.release_bytes(bytes);
    }

    /// Record an underlying map call and its outcome.
    #[inline]
    pub fn record_map_syscall(&self, ok: bool) {
        self.map_syscalls.fetch_add(1, Ordering::Relaxed);
        self.map_syscalls_counter.increment(1);
        if !ok {
            self.map_failures.fetch_add(1, Ordering::Relaxed);
            self.map_failures_counter.increment(1);
        }
    }

    /// Record an underlying unmap call and its outcome.
    #[inline]
    pub fn record_unmap_syscall(&self, ok: bool) {
        self.unmap_syscalls.fetch_add(1, Ordering::Relaxed);
        self.unmap_syscalls_counter.increment(1);
        if !ok {
            self.unmap_failures.fetch_add(1, Ordering::Relaxed);
            self.unmap_failures_counter.increment(1);
        }
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            free_failures: self.free_failures.load(Ordering::Relaxed),
            map_syscalls: self.map_syscalls.load(Ordering::Relaxed),
            unmap_syscalls: self.unmap_syscalls.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
            unmap_failures: self.unmap_failures.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }

    /// Memory type used as the metrics label.
    pub fn mem_type(&self) -> &'static str {
        self.mem_type
    }

    fn release_bytes(&self, bytes: usize) {
        let live = self.live_bytes.fetch_sub(bytes as u64, Ordering::Relaxed) - bytes as u64;
        self.live_bytes_gauge.set(live as f64);
    }
}

impl std::fmt::Debug for AllocatorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorMetrics")
            .field("mem_type", &self.mem_type)
            .field("stats", &self.snapshot())
            .finish()
    }
}
