//! Physically contiguous memory for DMA hardware.
//!
//! Video and imaging hardware on i.MX SoCs reads and writes memory by bus
//! address, so frames handed to it must be physically contiguous. The kernel
//! driver of the hardware block hands out such regions; this module wraps
//! that in a safe, thread-safe allocator.
//!
//! # Architecture
//!
//! - [`DeviceSession`]: An open descriptor on the kernel device node
//! - [`PhysMemDriver`]: The driver commands (allocate, release, map)
//! - [`PhysMemBlock`]: One allocated region, with its physical address
//! - [`PhysMemAllocator`]: The allocate/free/map/unmap contract
//! - [`DeviceAllocator`]: The contract implemented over a driver and session
//! - [`BlockMapping`]: RAII guard around a map/unmap pair
//! - [`AllocatorRegistry`]: Named allocator factories
//!
//! Mapping is reference counted per block. The first `map` creates the
//! virtual mapping, later calls share it, and the last `unmap` removes it.
//!
//! # Example
//!
//! ```rust,ignore
//! use imx_physmem::memory::{BlockMapping, MapAccess, PhysMemAllocator, emulated_allocator};
//!
//! let allocator = emulated_allocator();
//! let block = allocator.allocate(64 * 1024)?;
//!
//! {
//!     let mapping = BlockMapping::new(allocator.as_ref(), &block, MapAccess::WRITE)?;
//!     mapping.write_at(0, b"frame")?;
//! }
//!
//! println!("program the DMA engine with {}", block.phys_addr());
//! allocator.free(block)?;
//! ```

mod access;
mod allocator;
mod block;
mod driver;
mod emulated;
mod guard;
mod ipu;
mod mapping;
mod registry;
mod session;

pub use access::MapAccess;
pub use allocator::{AllocatorConfig, DeviceAllocator, PhysMemAllocator};
pub use block::{DriverHandle, PhysAddr, PhysMemBlock};
pub use driver::{Allocation, PhysMemDriver};
pub use emulated::{
    EMULATED_DEVICE_PATH, EMULATED_MEM_TYPE, EmulatedAllocator, EmulatedDriver, EmulatedRegion,
};
pub use guard::BlockMapping;
pub use ipu::{IPU_DEVICE_PATH, IPU_MEM_TYPE, IpuAllocator, IpuDriver};
pub use registry::{
    AllocatorFactory, AllocatorRegistry, EMULATED_FACTORY, IPU_FACTORY, emulated_allocator,
    ipu_allocator,
};
pub use session::DeviceSession;
