//! Observability: metrics for physical memory allocators.
//!
//! Logging goes through `tracing` directly at the call sites. This module
//! covers metrics via `metrics-rs`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `imx_physmem_allocations` | Counter | Successful allocations |
//! | `imx_physmem_frees` | Counter | Successful releases |
//! | `imx_physmem_alloc_failures` | Counter | Rejected allocations |
//! | `imx_physmem_free_failures` | Counter | Rejected releases |
//! | `imx_physmem_map_syscalls` | Counter | `mmap` calls issued |
//! | `imx_physmem_unmap_syscalls` | Counter | `munmap` calls issued |
//! | `imx_physmem_map_failures` | Counter | Failed `mmap` calls |
//! | `imx_physmem_unmap_failures` | Counter | Failed `munmap` calls |
//! | `imx_physmem_live_bytes` | Gauge | Bytes currently allocated |
//!
//! All metrics carry a `mem_type` label.
//!
//! ## Example
//!
//! ```rust,ignore
//! use imx_physmem::observability::init_metrics;
//!
//! // Describe metrics once at startup, then install any exporter.
//! init_metrics();
//! ```

mod metrics;

pub use self::metrics::{AllocatorMetrics, StatsSnapshot, init_metrics};
