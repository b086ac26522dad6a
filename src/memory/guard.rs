//! Scoped block mappings.

use super::{MapAccess, PhysMemAllocator, PhysMemBlock};
use crate::error::{Error, Result};
use rustix::io::Errno;
use std::fmt;
use std::ptr::NonNull;

/// A mapping reference that is released when dropped.
///
/// Wraps a [`PhysMemAllocator::map`] / [`PhysMemAllocator::unmap`] pair. The
/// guard exposes the first [`size`](PhysMemBlock::size) bytes of the block.
///
/// Other mappings of the same block alias this memory, and so does the
/// hardware. The safe accessors copy through raw pointers; the slice
/// accessors are `unsafe` for that reason.
///
/// # Example
///
/// ```rust,ignore
/// let block = allocator.allocate(4096)?;
/// {
///     let mapping = BlockMapping::new(&allocator, &block, MapAccess::WRITE)?;
///     mapping.write_at(0, b"header")?;
/// } // unmapped here
/// allocator.free(block)?;
/// ```
pub struct BlockMapping<'a, A: PhysMemAllocator + ?Sized> {
    allocator: &'a A,
    block: &'a PhysMemBlock,
    ptr: NonNull<u8>,
    access: MapAccess,
}

impl<'a, A: PhysMemAllocator + ?Sized> BlockMapping<'a, A> {
    /// Map `block` with `access`.
    pub fn new(allocator: &'a A, block: &'a PhysMemBlock, access: MapAccess) -> Result<Self> {
        let ptr = allocator.map(block, block.size(), access)?;
        Ok(Self {
            allocator,
            block,
            ptr,
            access,
        })
    }

    /// The mapped block.
    #[inline]
    pub fn block(&self) -> &PhysMemBlock {
        self.block
    }

    /// Access requested for this mapping.
    #[inline]
    pub fn access(&self) -> MapAccess {
        self.access
    }

    /// Number of accessible bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.block.size()
    }

    /// Whether the mapping exposes no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Start of the mapping, if it was requested writable.
    #[inline]
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.access
            .contains(MapAccess::WRITE)
            .then(|| self.ptr.as_ptr())
    }

    /// Copy bytes starting at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: The range lies inside the mapping, which stays valid while
        // self holds its reference.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    /// Copy `data` into the mapping starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let Some(ptr) = self.as_mut_ptr() else {
            return Err(Error::Map {
                addr: self.block.phys_addr(),
                source: Errno::ACCESS,
            });
        };
        self.check_range(offset, data.len())?;
        // SAFETY: As in read_at; the mapping is writable.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len()) };
        Ok(())
    }

    /// The mapping as a byte slice.
    ///
    /// # Safety
    ///
    /// Nothing else (another mapping, another thread, the hardware) may write
    /// the block while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Valid for len bytes; caller guarantees no concurrent writes.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// The mapping as a mutable byte slice, if it was requested writable.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the block's memory.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        // SAFETY: Caller guarantees exclusive access.
        self.as_mut_ptr()
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr, self.len()) })
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        let len = self.len();
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(Error::OutOfRange { offset, size, len }),
        }
    }
}

impl<A: PhysMemAllocator + ?Sized> Drop for BlockMapping<'_, A> {
    fn drop(&mut self) {
        self.allocator.unmap(self.block);
    }
}

impl<A: PhysMemAllocator + ?Sized> fmt::Debug for BlockMapping<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMapping")
            .field("phys_addr", &self.block.phys_addr())
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .field("access", &self.access)
            .finish()
    }
}
