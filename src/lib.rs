//! # imx-physmem
//!
//! Physically contiguous, DMA-capable memory on Freescale i.MX SoCs.
//!
//! The i.MX image processing unit (IPU) and its neighbours move pixels by
//! bus address. This crate allocates contiguous regions through the kernel
//! driver, reports their physical addresses, and maps them into the process
//! with reference-counted, thread-safe mappings.
//!
//! ## Features
//!
//! - **IPU allocator**: `IPU_ALLOC`/`IPU_FREE` on `/dev/mxc_ipu`
//! - **Emulated allocator**: memfd-backed stand-in for hosts without the hardware
//! - **Shared mappings**: one `mmap` per block however many users map it
//! - **Pluggable drivers**: other hardware blocks implement [`memory::PhysMemDriver`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use imx_physmem::prelude::*;
//!
//! let allocator = ipu_allocator();
//! let block = allocator.allocate(1280 * 720 * 2)?;
//!
//! let ptr = allocator.map(&block, block.size(), MapAccess::READ_WRITE)?;
//! // ... fill the frame through ptr, program the hardware with block.phys_addr()
//! allocator.unmap(&block);
//!
//! allocator.free(block)?;
//! ```
//!
//! The crate logs through `tracing` and records `metrics` counters; it never
//! installs a subscriber or recorder itself.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod memory;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        AllocatorConfig, AllocatorRegistry, BlockMapping, MapAccess, PhysAddr, PhysMemAllocator,
        PhysMemBlock, emulated_allocator, ipu_allocator,
    };
}

pub use error::{Error, Result};
