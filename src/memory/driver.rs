//! The contract between an allocator and a kernel memory driver.
//!
//! A driver knows how to turn a device descriptor into physically contiguous
//! memory: an allocate command that returns a physical address, a release
//! command that gives it back, and a way to map a physical address into the
//! process. Most drivers map by calling `mmap` on the device descriptor with
//! the physical address as offset, which is what the default methods do.
//!
//! Drivers are stateless with respect to the session: every call receives
//! the borrowed descriptor.

use super::{AllocatorConfig, DeviceSession, DriverHandle, PhysAddr};
use rustix::fd::BorrowedFd;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::any::Any;
use std::ptr::NonNull;

/// A successful driver allocation.
pub struct Allocation {
    /// Physical address of the new region.
    pub addr: PhysAddr,
    /// Optional bookkeeping kept on the block and handed back to
    /// [`PhysMemDriver::free`].
    pub handle: Option<DriverHandle>,
}

impl Allocation {
    /// An allocation without driver bookkeeping.
    pub fn new(addr: PhysAddr) -> Self {
        Self { addr, handle: None }
    }

    /// An allocation carrying driver bookkeeping.
    pub fn with_handle(addr: PhysAddr, handle: impl Any + Send + Sync) -> Self {
        Self {
            addr,
            handle: Some(Box::new(handle)),
        }
    }
}

/// A kernel driver that hands out physically contiguous memory.
pub trait PhysMemDriver: Send + Sync + 'static {
    /// Memory type reported by allocators using this driver.
    fn mem_type(&self) -> &'static str;

    /// Open a session with the device.
    ///
    /// The default opens `config.device_path` read/write. Failure is recorded
    /// in the returned session, not reported.
    fn open(&self, config: &AllocatorConfig) -> DeviceSession {
        let mut session = DeviceSession::new(&config.device_path);
        if let Err(err) = session.open() {
            tracing::error!(mem_type = self.mem_type(), "{}", err);
        }
        session
    }

    /// Allocate `size` bytes of physically contiguous memory.
    fn alloc(&self, fd: BorrowedFd<'_>, size: usize) -> Result<Allocation, Errno>;

    /// Release a region returned by [`alloc`](Self::alloc).
    fn free(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        handle: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), Errno>;

    /// Map `len` bytes at `addr` into the process as a shared mapping.
    fn map(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        len: usize,
        prot: ProtFlags,
    ) -> Result<NonNull<u8>, Errno> {
        // SAFETY: A null hint lets the kernel choose fresh address space, so
        // no existing mapping is replaced.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MapFlags::SHARED,
                fd,
                addr.as_u64(),
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(Errno::FAULT)
    }

    /// Remove a mapping created by [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping returned by `map`, and no
    /// references into it may outlive this call.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        // SAFETY: Guaranteed by the caller.
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }
}

/// Read the calling thread's errno after a failed libc call.
pub(crate) fn last_errno() -> Errno {
    Errno::from_io_error(&std::io::Error::last_os_error()).unwrap_or(Errno::IO)
}
