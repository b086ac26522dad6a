//! Emulated physical memory backed by a memfd.
//!
//! Hosts without i.MX hardware still need an allocator that behaves like the
//! real thing: a device descriptor, physical addresses handed out by an
//! allocate command, and `mmap` at the physical address as offset. This
//! driver provides exactly that on top of `memfd_create`:
//!
//! - "Physical" addresses are page-aligned offsets into the memfd. The first
//!   page is never handed out, so no block has address 0.
//! - Freed ranges go back to a first-fit free list and are coalesced with
//!   their neighbours. Their pages are punched out of the memfd.
//! - An optional capacity makes the device run out of memory (`ENOMEM`).
//!
//! ```rust,ignore
//! use imx_physmem::memory::{emulated_allocator, MapAccess};
//!
//! let allocator = emulated_allocator();
//! let block = allocator.allocate(4096)?;
//! let ptr = allocator.map(&block, 4096, MapAccess::READ_WRITE)?;
//! // ...
//! allocator.unmap(&block);
//! allocator.free(block)?;
//! ```

use super::driver::{Allocation, PhysMemDriver};
use super::{AllocatorConfig, DeviceAllocator, DeviceSession, PhysAddr};
use rustix::fd::BorrowedFd;
use rustix::fs::{FallocateFlags, MemfdFlags};
use rustix::io::Errno;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Memory type of emulated blocks.
pub const EMULATED_MEM_TYPE: &str = "ImxEmulatedMemory";

/// Path reported by emulated sessions.
pub const EMULATED_DEVICE_PATH: &str = "memfd:imx-physmem";

/// Bookkeeping attached to every emulated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedRegion {
    /// Allocation serial number, unique per driver.
    pub serial: u64,
    /// Length of the region in bytes.
    pub len: usize,
}

#[derive(Debug)]
struct EmulatedState {
    /// End of the highest region ever handed out.
    end: u64,
    /// Free ranges below `end`, start -> length.
    free: BTreeMap<u64, u64>,
    /// Live regions, start -> region.
    live: HashMap<u64, EmulatedRegion>,
    /// Bytes currently allocated.
    in_use: u64,
    next_serial: u64,
}

/// A driver that emulates contiguous device memory with a memfd.
#[derive(Debug)]
pub struct EmulatedDriver {
    page_size: u64,
    capacity: Option<u64>,
    state: Mutex<EmulatedState>,
}

impl EmulatedDriver {
    /// Create an emulated device without a capacity limit.
    pub fn new() -> Self {
        let page_size = rustix::param::page_size() as u64;
        Self {
            page_size,
            capacity: None,
            state: Mutex::new(EmulatedState {
                end: page_size,
                free: BTreeMap::new(),
                live: HashMap::new(),
                in_use: 0,
                next_serial: 1,
            }),
        }
    }

    /// Create an emulated device that holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity as u64),
            ..Self::new()
        }
    }

    /// Bytes currently allocated.
    pub fn in_use(&self) -> usize {
        self.lock().in_use as usize
    }

    /// Number of live regions.
    pub fn live_regions(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn round_up(&self, size: u64) -> Option<u64> {
        size.checked_add(self.page_size - 1)
            .map(|s| s / self.page_size * self.page_size)
    }
}

impl Default for EmulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedState {
    /// Take `len` bytes from the first free range that fits.
    fn take_free(&mut self, len: u64) -> Option<u64> {
        let (&start, &free_len) = self.free.iter().find(|&(_, &free_len)| free_len >= len)?;
        self.free.remove(&start);
        if free_len > len {
            self.free.insert(start + len, free_len - len);
        }
        Some(start)
    }

    /// Return a range to the free list, merging with adjacent ranges.
    fn give_back(&mut self, mut start: u64, mut len: u64) {
        let prev = self.free.range(..start).next_back().map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == self.end {
            self.end = start;
        } else {
            self.free.insert(start, len);
        }
    }
}

impl PhysMemDriver for EmulatedDriver {
    fn mem_type(&self) -> &'static str {
        EMULATED_MEM_TYPE
    }

    fn open(&self, _config: &AllocatorConfig) -> DeviceSession {
        let mut session = DeviceSession::new(EMULATED_DEVICE_PATH);
        if let Err(err) =
            session.open_with(|| rustix::fs::memfd_create("imx-physmem", MemfdFlags::CLOEXEC))
        {
            tracing::error!(mem_type = EMULATED_MEM_TYPE, "{}", err);
        }
        session
    }

    fn alloc(&self, fd: BorrowedFd<'_>, size: usize) -> Result<Allocation, Errno> {
        if size == 0 {
            return Err(Errno::INVAL);
        }
        let len = self.round_up(size as u64).ok_or(Errno::INVAL)?;

        let mut state = self.lock();
        if let Some(capacity) = self.capacity {
            if state.in_use + len > capacity {
                return Err(Errno::NOMEM);
            }
        }

        let start = match state.take_free(len) {
            Some(start) => start,
            None => {
                let start = state.end;
                let end = start.checked_add(len).ok_or(Errno::NOMEM)?;
                rustix::fs::ftruncate(fd, end)?;
                state.end = end;
                start
            }
        };

        let region = EmulatedRegion {
            serial: state.next_serial,
            len: len as usize,
        };
        state.next_serial += 1;
        state.in_use += len;
        state.live.insert(start, region);

        Ok(Allocation::with_handle(PhysAddr::new(start), region))
    }

    fn free(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        handle: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), Errno> {
        let mut state = self.lock();
        let start = addr.as_u64();
        let region = *state.live.get(&start).ok_or(Errno::INVAL)?;

        // A stale block from an earlier allocation at the same address.
        if let Some(expected) = handle.and_then(|h| h.downcast_ref::<EmulatedRegion>()) {
            if *expected != region {
                return Err(Errno::INVAL);
            }
        }

        state.live.remove(&start);
        state.in_use -= region.len as u64;

        // Drop the pages so freed memory reads back as zeroes.
        if let Err(errno) = rustix::fs::fallocate(
            fd,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            start,
            region.len as u64,
        ) {
            tracing::debug!(phys_addr = %addr, %errno, "could not punch out freed pages");
        }

        state.give_back(start, region.len as u64);
        Ok(())
    }
}

/// An allocator backed by emulated device memory.
pub type EmulatedAllocator = DeviceAllocator<EmulatedDriver>;

impl DeviceAllocator<EmulatedDriver> {
    /// Create an emulated allocator without a capacity limit.
    pub fn emulated() -> Self {
        Self::new(EmulatedDriver::new(), AllocatorConfig::default())
    }
}
