//! Physical memory blocks.

use super::MapAccess;
use super::mapping::MappingState;
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;

/// Opaque per-block bookkeeping a driver may attach at allocation time.
pub type DriverHandle = Box<dyn Any + Send + Sync>;

/// A hardware bus address of a physically contiguous region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wrap a raw bus address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The raw bus address.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// One allocated region of physically contiguous, DMA-capable memory.
///
/// Blocks are created by [`PhysMemAllocator::allocate`] and consumed by
/// [`PhysMemAllocator::free`]. In between, the block can be mapped into the
/// process any number of times; all mappings share one underlying `mmap`.
///
/// The physical address never changes while the block lives. Hand it to the
/// hardware with [`phys_addr`](Self::phys_addr).
///
/// Dropping a block without freeing it leaks the device memory.
///
/// [`PhysMemAllocator::allocate`]: super::PhysMemAllocator::allocate
/// [`PhysMemAllocator::free`]: super::PhysMemAllocator::free
pub struct PhysMemBlock {
    phys_addr: PhysAddr,
    size: usize,
    maxsize: usize,
    allocator_id: u64,
    pub(crate) mapping: MappingState,
    handle: Option<DriverHandle>,
    released: bool,
}

impl PhysMemBlock {
    pub(crate) fn new(
        allocator_id: u64,
        phys_addr: PhysAddr,
        size: usize,
        maxsize: usize,
        handle: Option<DriverHandle>,
    ) -> Self {
        Self {
            phys_addr,
            size,
            maxsize,
            allocator_id,
            mapping: MappingState::new(),
            handle,
            released: false,
        }
    }

    /// Physical address of the block.
    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// Requested size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocated size in bytes (the requested size rounded up to a page).
    #[inline]
    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    /// Number of outstanding mappings.
    #[inline]
    pub fn mapping_refcount(&self) -> u32 {
        self.mapping.refcount()
    }

    /// Whether the block currently has a virtual mapping.
    pub fn is_mapped(&self) -> bool {
        self.mapping.region().is_some()
    }

    /// Virtual address of the current mapping, if any.
    pub fn mapped_virt_addr(&self) -> Option<NonNull<u8>> {
        self.mapping.region().map(|region| region.ptr)
    }

    /// Access flags of the current mapping, if any.
    pub fn mapping_flags(&self) -> Option<MapAccess> {
        self.mapping.region().map(|region| region.access)
    }

    /// The driver's bookkeeping for this block, if it has any of type `T`.
    pub fn driver_handle<T: Any>(&self) -> Option<&T> {
        self.handle.as_deref()?.downcast_ref::<T>()
    }

    pub(crate) fn raw_driver_handle(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.handle.as_deref()
    }

    pub(crate) fn allocator_id(&self) -> u64 {
        self.allocator_id
    }

    /// Mark the device memory as handed back to the driver.
    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl Drop for PhysMemBlock {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                phys_addr = %self.phys_addr,
                size = self.maxsize,
                mappings = self.mapping.refcount(),
                "physical memory block dropped without being freed; leaking it"
            );
        }
    }
}

impl fmt::Debug for PhysMemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysMemBlock")
            .field("phys_addr", &self.phys_addr)
            .field("size", &self.size)
            .field("maxsize", &self.maxsize)
            .field("mapping_refcount", &self.mapping.refcount())
            .field("has_driver_handle", &self.handle.is_some())
            .finish()
    }
}
