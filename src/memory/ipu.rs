//! Freescale i.MX IPU physical memory.
//!
//! The IPU driver (`/dev/mxc_ipu`) exports two ioctls for contiguous DMA
//! memory. Both take a `dma_addr_t` that carries the size in and the physical
//! address out (`IPU_ALLOC`), or the physical address in (`IPU_FREE`).
//! Memory is mapped with `mmap` on the device fd, using the physical address
//! as the offset.

use super::driver::{Allocation, PhysMemDriver, last_errno};
use super::{AllocatorConfig, DeviceAllocator, PhysAddr};
use rustix::fd::{AsRawFd, BorrowedFd};
use rustix::io::Errno;
use std::any::Any;

/// Default IPU device node.
pub const IPU_DEVICE_PATH: &str = "/dev/mxc_ipu";

/// Memory type of IPU blocks.
pub const IPU_MEM_TYPE: &str = "ImxIpuMemory";

/// IPU_ALLOC ioctl number: _IOWR('I', 0x3, int)
const IPU_ALLOC: libc::c_ulong = 0xc004_4903;

/// IPU_FREE ioctl number: _IOW('I', 0x4, int)
const IPU_FREE: libc::c_ulong = 0x4004_4904;

/// `dma_addr_t` of the 32-bit i.MX kernels the IPU ships with.
type DmaAddr = u32;

/// Driver for the i.MX IPU contiguous memory ioctls.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpuDriver;

impl PhysMemDriver for IpuDriver {
    fn mem_type(&self) -> &'static str {
        IPU_MEM_TYPE
    }

    fn alloc(&self, fd: BorrowedFd<'_>, size: usize) -> Result<Allocation, Errno> {
        let mut addr = DmaAddr::try_from(size).map_err(|_| Errno::INVAL)?;

        // SAFETY: IPU_ALLOC reads and writes exactly one dma_addr_t through
        // the pointer, which lives for the duration of the call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), IPU_ALLOC, &mut addr as *mut DmaAddr) };
        if ret < 0 {
            return Err(last_errno());
        }

        Ok(Allocation::new(PhysAddr::new(u64::from(addr))))
    }

    fn free(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        _handle: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), Errno> {
        let mut addr = DmaAddr::try_from(addr.as_u64()).map_err(|_| Errno::INVAL)?;

        // SAFETY: IPU_FREE reads one dma_addr_t through the pointer.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), IPU_FREE, &mut addr as *mut DmaAddr) };
        if ret < 0 {
            return Err(last_errno());
        }

        Ok(())
    }
}

/// An allocator backed by the IPU device.
pub type IpuAllocator = DeviceAllocator<IpuDriver>;

impl DeviceAllocator<IpuDriver> {
    /// Create an IPU allocator on the default device node.
    ///
    /// Never fails; check [`is_ready`](super::PhysMemAllocator::is_ready).
    pub fn ipu() -> Self {
        Self::new(IpuDriver, AllocatorConfig::default())
    }
}
