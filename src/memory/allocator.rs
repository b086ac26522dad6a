//! Physical memory allocators.
//!
//! [`PhysMemAllocator`] is the capability every physical memory allocator
//! offers: allocate, free, map, unmap. [`DeviceAllocator`] implements it on
//! top of a [`PhysMemDriver`] and the [`DeviceSession`] it opens at
//! construction.
//!
//! # Lifecycle
//!
//! Construction never fails. If the device cannot be opened the allocator
//! still exists, [`is_ready`](PhysMemAllocator::is_ready) returns `false` and
//! every allocation fails with the errno recorded by the failed open.
//! Dropping the allocator closes the device.
//!
//! # Example
//!
//! ```rust,ignore
//! use imx_physmem::memory::{IpuAllocator, MapAccess, PhysMemAllocator};
//!
//! let allocator = IpuAllocator::ipu();
//! if let Some(err) = allocator.open_error() {
//!     return Err(err);
//! }
//!
//! let block = allocator.allocate(1920 * 1080 * 2)?;
//! let ptr = allocator.map(&block, block.size(), MapAccess::WRITE)?;
//! // Fill the frame, hand block.phys_addr() to the hardware...
//! allocator.unmap(&block);
//! allocator.free(block)?;
//! ```

use super::BlockMapping;
use super::driver::PhysMemDriver;
use super::ipu::IPU_DEVICE_PATH;
use super::mapping::{Acquired, MappedRegion, Release};
use super::{DeviceSession, MapAccess, PhysAddr, PhysMemBlock};
use crate::error::{Error, Result};
use crate::observability::{AllocatorMetrics, StatsSnapshot};
use rustix::io::Errno;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique allocator IDs.
static ALLOCATOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique allocator ID.
fn next_allocator_id() -> u64 {
    ALLOCATOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Device node to open.
    pub device_path: PathBuf,
    /// Allocation granularity. Requested sizes are rounded up to a multiple.
    pub page_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(IPU_DEVICE_PATH),
            page_size: rustix::param::page_size(),
        }
    }
}

impl AllocatorConfig {
    /// Use a different device node.
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Use a different allocation granularity.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Round `size` up to the allocation granularity.
    ///
    /// Returns `None` for zero sizes and on overflow.
    pub fn page_align(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let page = self.page_size.max(1);
        size.checked_add(page - 1).map(|s| s / page * page)
    }
}

/// Allocate, free, map and unmap physically contiguous memory.
///
/// Implementations are interchangeable: callers only rely on this contract,
/// whichever hardware block provides the memory.
///
/// All methods may be called concurrently from any thread, including on the
/// same block.
pub trait PhysMemAllocator: Send + Sync {
    /// Memory type of the blocks this allocator hands out.
    fn mem_type(&self) -> &str;

    /// Whether the allocator can serve allocations.
    fn is_ready(&self) -> bool;

    /// Allocate at least `size` bytes of physically contiguous memory.
    ///
    /// # Errors
    ///
    /// [`Error::Alloc`] if `size` is zero, the device is unavailable, or the
    /// driver rejects the request.
    fn allocate(&self, size: usize) -> Result<PhysMemBlock>;

    /// Release a block.
    ///
    /// # Errors
    ///
    /// - [`Error::StillMapped`] if the block has outstanding mappings. The
    ///   block is not released; [`Error::into_block`] hands it back so it can
    ///   be unmapped and freed again.
    /// - [`Error::ForeignBlock`] if another allocator produced the block. The
    ///   block is handed back the same way.
    /// - [`Error::Free`] if the driver rejects the release. The state of the
    ///   physical memory is undefined afterwards.
    fn free(&self, block: PhysMemBlock) -> Result<()>;

    /// Map a block into the process and take a mapping reference.
    ///
    /// The first reference performs the mapping; later ones share it and
    /// receive the same address. `size` must be in `1..=block.maxsize()`.
    ///
    /// # Errors
    ///
    /// [`Error::Map`] if the arguments are invalid or the underlying mapping
    /// fails. No reference is held afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `access` includes write access while the block is already
    /// mapped read-only.
    fn map(&self, block: &PhysMemBlock, size: usize, access: MapAccess) -> Result<NonNull<u8>>;

    /// Drop a mapping reference; the last one removes the mapping.
    ///
    /// Failures are logged, never returned.
    fn unmap(&self, block: &PhysMemBlock);

    /// Copy `size` bytes starting at `offset` into a new block.
    ///
    /// `None` copies up to the end of the block.
    fn copy(&self, block: &PhysMemBlock, offset: usize, size: Option<usize>) -> Result<PhysMemBlock> {
        let len = block.size();
        let size = size.unwrap_or(len.saturating_sub(offset));
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > len) {
            return Err(Error::OutOfRange { offset, size, len });
        }

        let copy = self.allocate(size)?;
        if let Err(err) = copy_range(self, block, &copy, offset, size) {
            if let Err(free_err) = self.free(copy) {
                tracing::error!(mem_type = self.mem_type(), "{}", free_err);
            }
            return Err(err);
        }
        Ok(copy)
    }
}

fn copy_range<A: PhysMemAllocator + ?Sized>(
    allocator: &A,
    source: &PhysMemBlock,
    target: &PhysMemBlock,
    offset: usize,
    size: usize,
) -> Result<()> {
    let from = BlockMapping::new(allocator, source, MapAccess::READ)?;
    let to = BlockMapping::new(allocator, target, MapAccess::READ_WRITE)?;
    let Some(dst) = to.as_mut_ptr() else {
        return Err(Error::Map {
            addr: target.phys_addr(),
            source: Errno::ACCESS,
        });
    };
    // SAFETY: Both mappings cover at least `size` bytes past the given
    // offsets and belong to different blocks, so they do not overlap.
    unsafe { std::ptr::copy_nonoverlapping(from.as_ptr().add(offset), dst, size) };
    Ok(())
}

/// An allocator driven by a kernel device.
pub struct DeviceAllocator<D: PhysMemDriver> {
    id: u64,
    driver: D,
    session: DeviceSession,
    config: AllocatorConfig,
    metrics: AllocatorMetrics,
}

impl<D: PhysMemDriver> DeviceAllocator<D> {
    /// Create an allocator and open its device.
    ///
    /// Does not fail if the device cannot be opened; see
    /// [`open_error`](Self::open_error).
    pub fn new(driver: D, config: AllocatorConfig) -> Self {
        let session = driver.open(&config);
        let mem_type = driver.mem_type();

        if session.is_open() {
            tracing::info!(mem_type, path = %session.path().display(), "initialized allocator");
        } else {
            tracing::error!(
                mem_type,
                path = %session.path().display(),
                "could not open device; allocations will fail"
            );
        }

        Self {
            id: next_allocator_id(),
            metrics: AllocatorMetrics::new(mem_type),
            driver,
            session,
            config,
        }
    }

    /// The driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The device session.
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// The configuration the allocator was created with.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Why the device could not be opened, if it could not.
    pub fn open_error(&self) -> Option<Error> {
        self.session.open_error().map(|source| Error::DeviceOpen {
            path: self.session.path().to_path_buf(),
            source,
        })
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    fn check_owner(&self, block: &PhysMemBlock) -> Result<()> {
        if block.allocator_id() == self.id {
            Ok(())
        } else {
            tracing::error!(
                mem_type = self.mem_type(),
                phys_addr = %block.phys_addr(),
                "block belongs to another allocator"
            );
            Err(Error::ForeignBlock {
                addr: block.phys_addr(),
                block: None,
            })
        }
    }

    /// Remove a mapping whose last reference is gone.
    fn teardown(&self, addr: PhysAddr, region: MappedRegion) {
        // SAFETY: The region was created by this driver's `map`, and the
        // last mapping reference is gone.
        let result = unsafe { self.driver.unmap(region.ptr, region.len) };
        self.metrics.record_unmap_syscall(result.is_ok());
        if let Err(errno) = result {
            tracing::error!(
                mem_type = self.mem_type(),
                phys_addr = %addr,
                "unmapping memory-mapped physical memory failed: {}",
                errno
            );
        }
    }
}

impl<D: PhysMemDriver> PhysMemAllocator for DeviceAllocator<D> {
    fn mem_type(&self) -> &str {
        self.driver.mem_type()
    }

    fn is_ready(&self) -> bool {
        self.session.is_open()
    }

    fn allocate(&self, size: usize) -> Result<PhysMemBlock> {
        let allocated = self.config.page_align(size).ok_or(Errno::INVAL).and_then(|maxsize| {
            let fd = self.session.fd()?;
            self.driver.alloc(fd, maxsize).map(|allocation| (maxsize, allocation))
        });

        match allocated {
            Ok((maxsize, allocation)) => {
                tracing::debug!(
                    mem_type = self.mem_type(),
                    size,
                    maxsize,
                    phys_addr = %allocation.addr,
                    "allocated physical memory"
                );
                self.metrics.record_allocation(maxsize);
                Ok(PhysMemBlock::new(
                    self.id,
                    allocation.addr,
                    size,
                    maxsize,
                    allocation.handle,
                ))
            }
            Err(source) => {
                let err = Error::Alloc { size, source };
                tracing::error!(mem_type = self.mem_type(), "{}", err);
                self.metrics.record_alloc_failure();
                Err(err)
            }
        }
    }

    fn free(&self, mut block: PhysMemBlock) -> Result<()> {
        if let Err(Error::ForeignBlock { addr, .. }) = self.check_owner(&block) {
            return Err(Error::ForeignBlock {
                addr,
                block: Some(Box::new(block)),
            });
        }

        let addr = block.phys_addr();
        let mappings = block.mapping_refcount();
        if mappings != 0 {
            let err = Error::StillMapped {
                addr,
                mappings,
                block: Box::new(block),
            };
            tracing::error!(mem_type = self.mem_type(), "{}", err);
            return Err(err);
        }

        let released = self
            .session
            .fd()
            .and_then(|fd| self.driver.free(fd, addr, block.raw_driver_handle()));
        block.mark_released();

        match released {
            Ok(()) => {
                tracing::debug!(mem_type = self.mem_type(), phys_addr = %addr, "freed physical memory");
                self.metrics.record_free(block.maxsize());
                Ok(())
            }
            Err(source) => {
                let err = Error::Free { addr, source };
                tracing::error!(mem_type = self.mem_type(), "{}", err);
                self.metrics.record_free_failure(block.maxsize());
                Err(err)
            }
        }
    }

    fn map(&self, block: &PhysMemBlock, size: usize, access: MapAccess) -> Result<NonNull<u8>> {
        self.check_owner(block)?;

        let addr = block.phys_addr();
        let len = block.maxsize();
        let fail = |source: Errno| {
            let err = Error::Map { addr, source };
            tracing::error!(mem_type = self.mem_type(), "{}", err);
            err
        };

        if size == 0 || size > len || access.is_empty() {
            return Err(fail(Errno::INVAL));
        }
        let fd = self.session.fd().map_err(fail)?;

        let acquired = block
            .mapping
            .acquire(
                access,
                || {
                    let mapped = self.driver.map(fd, addr, len, access.to_prot());
                    self.metrics.record_map_syscall(mapped.is_ok());
                    mapped.map(|ptr| MappedRegion { ptr, len, access })
                },
                |region| self.teardown(addr, region),
            )
            .map_err(fail)?;

        let region = acquired.region();
        tracing::trace!(
            mem_type = self.mem_type(),
            virt_addr = ?region.ptr,
            phys_addr = %addr,
            established = matches!(acquired, Acquired::Established(_)),
            "mapped physical memory"
        );
        Ok(region.ptr)
    }

    fn unmap(&self, block: &PhysMemBlock) {
        if self.check_owner(block).is_err() {
            return;
        }

        let addr = block.phys_addr();
        let outcome = block
            .mapping
            .release(|region| self.teardown(addr, region));

        match outcome {
            Release::Unmapped(region) => tracing::trace!(
                mem_type = self.mem_type(),
                virt_addr = ?region.ptr,
                phys_addr = %addr,
                "unmapped physical memory"
            ),
            Release::Retained(remaining) => tracing::trace!(
                mem_type = self.mem_type(),
                phys_addr = %addr,
                remaining,
                "released mapping reference"
            ),
            Release::Unbalanced => tracing::error!(
                mem_type = self.mem_type(),
                phys_addr = %addr,
                "unmap without a matching map"
            ),
        }
    }
}

impl<D: PhysMemDriver> Drop for DeviceAllocator<D> {
    fn drop(&mut self) {
        tracing::info!(mem_type = self.driver.mem_type(), "shutting down allocator");
        self.session.close();
    }
}

impl<D: PhysMemDriver> std::fmt::Debug for DeviceAllocator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("id", &self.id)
            .field("mem_type", &self.driver.mem_type())
            .field("session", &self.session)
            .field("config", &self.config)
            .finish()
    }
}
