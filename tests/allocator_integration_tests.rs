//! Integration tests for the allocator lifecycle and shared mappings.
//!
//! These run against the emulated driver, wrapped in a driver that counts
//! the underlying map/unmap calls and can inject failures.

use imx_physmem::Error;
use imx_physmem::memory::{
    Allocation, AllocatorConfig, BlockMapping, DeviceAllocator, DeviceSession, EmulatedDriver,
    IpuAllocator, IpuDriver, MapAccess, PhysAddr, PhysMemAllocator, PhysMemDriver,
};
use rustix::fd::BorrowedFd;
use rustix::io::Errno;
use rustix::mm::ProtFlags;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// ============================================================================
// Counting driver
// ============================================================================

/// Emulated driver that counts map/unmap calls and fails calls on request.
#[derive(Default)]
struct CountingDriver {
    inner: EmulatedDriver,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    fail_maps: AtomicUsize,
    fail_unmaps: AtomicUsize,
    fail_frees: AtomicUsize,
    map_delay: Option<Duration>,
}

/// Consume one pending injected failure, if any.
fn take_failure(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl CountingDriver {
    fn with_map_delay(delay: Duration) -> Self {
        Self {
            map_delay: Some(delay),
            ..Self::default()
        }
    }

    fn fail_next_maps(&self, count: usize) {
        self.fail_maps.store(count, Ordering::SeqCst);
    }

    fn fail_next_unmaps(&self, count: usize) {
        self.fail_unmaps.store(count, Ordering::SeqCst);
    }

    fn fail_next_frees(&self, count: usize) {
        self.fail_frees.store(count, Ordering::SeqCst);
    }

    fn maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }
}

impl PhysMemDriver for CountingDriver {
    fn mem_type(&self) -> &'static str {
        "CountingMemory"
    }

    fn open(&self, config: &AllocatorConfig) -> DeviceSession {
        self.inner.open(config)
    }

    fn alloc(&self, fd: BorrowedFd<'_>, size: usize) -> Result<Allocation, Errno> {
        self.inner.alloc(fd, size)
    }

    fn free(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        handle: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), Errno> {
        if take_failure(&self.fail_frees) {
            return Err(Errno::BUSY);
        }
        self.inner.free(fd, addr, handle)
    }

    fn map(
        &self,
        fd: BorrowedFd<'_>,
        addr: PhysAddr,
        len: usize,
        prot: ProtFlags,
    ) -> Result<NonNull<u8>, Errno> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.map_delay {
            thread::sleep(delay);
        }
        if take_failure(&self.fail_maps) {
            return Err(Errno::NOMEM);
        }
        self.inner.map(fd, addr, len, prot)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        // SAFETY: Forwarded from the caller.
        let result = unsafe { self.inner.unmap(ptr, len) };
        if take_failure(&self.fail_unmaps) {
            return Err(Errno::INVAL);
        }
        result
    }
}

fn counting_allocator() -> DeviceAllocator<CountingDriver> {
    DeviceAllocator::new(CountingDriver::default(), AllocatorConfig::default())
}

// ============================================================================
// Lifecycle
// ============================================================================

/// allocate, map, write and read back a pattern, unmap, free.
#[test]
fn test_map_write_read_round_trip() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();

    let ptr = allocator.map(&block, 4096, MapAccess::READ_WRITE).unwrap();
    // SAFETY: The mapping covers 4096 bytes and only this thread uses it.
    unsafe {
        for i in 0..4096 {
            ptr.as_ptr().add(i).write((i * 7 % 256) as u8);
        }
        for i in 0..4096 {
            assert_eq!(ptr.as_ptr().add(i).read(), (i * 7 % 256) as u8);
        }
    }

    allocator.unmap(&block);
    assert_eq!(block.mapping_refcount(), 0);
    assert!(block.mapped_virt_addr().is_none());
    allocator.free(block).unwrap();

    assert_eq!(allocator.driver().maps(), 1);
    assert_eq!(allocator.driver().unmaps(), 1);
}

/// A missing device node does not fail construction, only allocation.
#[test]
fn test_absent_device_fails_on_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mxc_ipu");
    let allocator = IpuAllocator::new(IpuDriver, AllocatorConfig::default().with_device_path(&path));

    assert!(!allocator.is_ready());
    match allocator.open_error() {
        Some(Error::DeviceOpen { path: failed, source }) => {
            assert_eq!(failed, path);
            assert_eq!(source, Errno::NOENT);
        }
        other => panic!("expected DeviceOpen, got {other:?}"),
    }

    for _ in 0..2 {
        let err = allocator.allocate(4096).unwrap_err();
        assert!(matches!(err, Error::Alloc { size: 4096, .. }));
        assert_eq!(err.errno(), Some(Errno::NOENT));
    }
    assert_eq!(allocator.stats().alloc_failures, 2);
}

/// Live blocks never share physical memory.
#[test]
fn test_live_blocks_do_not_alias() {
    let allocator = counting_allocator();
    let page = allocator.config().page_size;

    let mut blocks: Vec<_> = [1, page, 3 * page + 1, 17, 8 * page]
        .into_iter()
        .map(|size| allocator.allocate(size).unwrap())
        .collect();

    // Free every other block and allocate into the holes.
    let freed: Vec<_> = (0..blocks.len()).step_by(2).rev().map(|i| blocks.remove(i)).collect();
    for block in freed {
        allocator.free(block).unwrap();
    }
    for size in [page, 2 * page, 5] {
        blocks.push(allocator.allocate(size).unwrap());
    }

    let mut ranges: Vec<_> = blocks
        .iter()
        .map(|b| (b.phys_addr().as_u64(), b.phys_addr().as_u64() + b.maxsize() as u64))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping blocks: {pair:?}");
    }

    for block in blocks {
        allocator.free(block).unwrap();
    }
    assert_eq!(allocator.driver().inner.live_regions(), 0);
}

/// Freeing a mapped block is refused.
#[test]
fn test_free_mapped_block_is_refused() {
    let allocator = counting_allocator();
    let block = allocator.allocate(100).unwrap();
    let phys_addr = block.phys_addr();
    allocator.map(&block, 100, MapAccess::READ).unwrap();
    allocator.map(&block, 100, MapAccess::READ).unwrap();

    let block = match allocator.free(block) {
        Err(Error::StillMapped {
            addr,
            mappings,
            block,
        }) => {
            assert_eq!(addr, phys_addr);
            assert_eq!(mappings, 2);
            *block
        }
        other => panic!("expected StillMapped, got {other:?}"),
    };
    assert_eq!(allocator.stats().frees, 0);
    assert_eq!(allocator.driver().inner.live_regions(), 1);

    // Unmapping hands the block back to a state where free succeeds.
    allocator.unmap(&block);
    allocator.unmap(&block);
    allocator.free(block).unwrap();
    assert_eq!(allocator.driver().inner.live_regions(), 0);
    assert_eq!(allocator.driver().unmaps(), 1);
}

/// A rejected release is reported with its errno and the bytes are written off.
#[test]
fn test_free_failure_reports_errno() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();
    let phys_addr = block.phys_addr();
    assert_eq!(allocator.stats().live_bytes, 4096);

    allocator.driver().fail_next_frees(1);
    match allocator.free(block) {
        Err(Error::Free { addr, source }) => {
            assert_eq!(addr, phys_addr);
            assert_eq!(source, Errno::BUSY);
        }
        other => panic!("expected Free, got {other:?}"),
    }

    let stats = allocator.stats();
    assert_eq!(stats.free_failures, 1);
    assert_eq!(stats.frees, 0);
    assert_eq!(stats.live_bytes, 0);
}

/// Session close is idempotent, also after a failed open.
#[test]
fn test_session_close_is_idempotent() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut session = DeviceSession::new(file.path());
    session.open().unwrap();
    session.close();
    session.close();
    assert!(!session.is_open());
    assert_eq!(session.fd().err(), Some(Errno::BADF));

    let dir = tempfile::tempdir().unwrap();
    let mut failed = DeviceSession::new(dir.path().join("absent"));
    assert!(failed.open().is_err());
    failed.close();
    failed.close();
    assert!(!failed.is_open());
}

// ============================================================================
// Mapping failures
// ============================================================================

/// A failed map leaves no reference behind and can be retried.
#[test]
fn test_map_failure_rolls_back() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();

    allocator.driver().fail_next_maps(1);
    let err = allocator.map(&block, 4096, MapAccess::READ).unwrap_err();
    assert!(matches!(err, Error::Map { source, .. } if source == Errno::NOMEM));
    assert_eq!(block.mapping_refcount(), 0);
    assert!(!block.is_mapped());

    let ptr = allocator.map(&block, 4096, MapAccess::READ).unwrap();
    assert_eq!(block.mapped_virt_addr(), Some(ptr));
    allocator.unmap(&block);

    assert_eq!(allocator.driver().maps(), 2);
    assert_eq!(allocator.driver().unmaps(), 1);
    let stats = allocator.stats();
    assert_eq!(stats.map_failures, 1);
    assert_eq!(stats.map_syscalls, 2);
    allocator.free(block).unwrap();
}

/// A failing unmap is only logged; the block still ends up unmapped.
#[test]
fn test_unmap_failure_is_swallowed() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();

    allocator.map(&block, 4096, MapAccess::READ_WRITE).unwrap();
    allocator.driver().fail_next_unmaps(1);
    allocator.unmap(&block);

    assert!(!block.is_mapped());
    assert_eq!(block.mapping_refcount(), 0);
    let stats = allocator.stats();
    assert_eq!(stats.unmap_syscalls, 1);
    assert_eq!(stats.unmap_failures, 1);

    // The next map starts from the unmapped state.
    let ptr = allocator.map(&block, 4096, MapAccess::READ).unwrap();
    assert_eq!(block.mapped_virt_addr(), Some(ptr));
    assert_eq!(block.mapping_flags(), Some(MapAccess::READ));
    assert_eq!(allocator.driver().maps(), 2);

    allocator.unmap(&block);
    assert_eq!(allocator.stats().unmap_failures, 1);
    allocator.free(block).unwrap();
}

/// Requesting write access against a read-only mapping panics.
#[test]
#[should_panic(expected = "access to a block mapped with")]
fn test_incompatible_access_panics() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();
    allocator.map(&block, 4096, MapAccess::READ).unwrap();
    let _ = allocator.map(&block, 4096, MapAccess::WRITE);
}

/// The panicking call does not keep its reference.
#[test]
fn test_incompatible_access_returns_reference() {
    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();
    allocator.map(&block, 4096, MapAccess::READ).unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| {
        allocator.map(&block, 4096, MapAccess::READ_WRITE)
    }));
    assert!(result.is_err());
    assert_eq!(block.mapping_refcount(), 1);
    assert_eq!(block.mapping_flags(), Some(MapAccess::READ));

    allocator.unmap(&block);
    assert!(!block.is_mapped());
    allocator.free(block).unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

/// A panicking writer racing the last reader's unmap never strands a mapping.
#[test]
fn test_incompatible_access_racing_unmap() {
    const ITERATIONS: usize = 2_000;

    let allocator = counting_allocator();
    let block = allocator.allocate(4096).unwrap();
    let barrier = Barrier::new(2);

    for _ in 0..ITERATIONS {
        allocator.map(&block, 4096, MapAccess::READ).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                let result = catch_unwind(AssertUnwindSafe(|| {
                    allocator.map(&block, 4096, MapAccess::WRITE)
                }));
                // The reader may already be gone, in which case this maps.
                if let Ok(mapped) = result {
                    mapped.unwrap();
                    allocator.unmap(&block);
                }
            });
            s.spawn(|| {
                barrier.wait();
                allocator.unmap(&block);
            });
        });

        assert_eq!(block.mapping_refcount(), 0);
        assert!(!block.is_mapped());
    }

    let driver = allocator.driver();
    assert_eq!(driver.maps(), driver.unmaps());
    allocator.free(block).unwrap();
}

/// Two threads mapping a fresh block get the same address; one syscall each way.
#[test]
fn test_two_threads_share_mapping() {
    let allocator = DeviceAllocator::new(
        CountingDriver::with_map_delay(Duration::from_millis(20)),
        AllocatorConfig::default(),
    );
    let block = allocator.allocate(4096).unwrap();
    let barrier = Barrier::new(2);

    let addrs: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let ptr = allocator.map(&block, 4096, MapAccess::READ_WRITE).unwrap();
                    ptr.as_ptr() as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(addrs[0], addrs[1]);
    assert_eq!(block.mapping_refcount(), 2);
    assert_eq!(allocator.driver().maps(), 1);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                barrier.wait();
                allocator.unmap(&block);
            });
        }
    });

    assert_eq!(block.mapping_refcount(), 0);
    assert!(block.mapped_virt_addr().is_none());
    assert_eq!(allocator.driver().unmaps(), 1);
    allocator.free(block).unwrap();
}

/// N concurrent maps issue exactly one map call and observe one address.
#[test]
fn test_concurrent_maps_single_syscall() {
    const THREADS: usize = 8;

    let allocator = DeviceAllocator::new(
        CountingDriver::with_map_delay(Duration::from_millis(5)),
        AllocatorConfig::default(),
    );
    let block = allocator.allocate(64 * 1024).unwrap();
    let barrier = Barrier::new(THREADS);

    let addrs: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let block = &block;
                let allocator = &allocator;
                let barrier = &barrier;
                s.spawn(move || {
                    // Write-capable requests are compatible whoever maps first.
                    let access = if i % 2 == 0 {
                        MapAccess::READ_WRITE
                    } else {
                        MapAccess::WRITE
                    };
                    barrier.wait();
                    allocator
                        .map(block, block.size(), access)
                        .unwrap()
                        .as_ptr() as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(addrs.iter().all(|&addr| addr == addrs[0]));
    assert_eq!(block.mapping_refcount(), THREADS as u32);
    assert_eq!(allocator.driver().maps(), 1);

    for _ in 0..THREADS {
        allocator.unmap(&block);
    }
    assert_eq!(allocator.driver().unmaps(), 1);
    allocator.free(block).unwrap();
}

/// Any interleaving of balanced map/unmap pairs ends unmapped.
#[test]
fn test_map_unmap_stress() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 500;

    let allocator = Arc::new(counting_allocator());
    let block = Arc::new(allocator.allocate(4096).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let block = Arc::clone(&block);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ITERATIONS {
                    let ptr = allocator.map(&block, 4096, MapAccess::READ_WRITE).unwrap();
                    // SAFETY: Each thread owns one distinct byte of the block.
                    unsafe { ptr.as_ptr().add(t).write(i as u8) };
                    if i % 3 == 0 {
                        thread::yield_now();
                    }
                    allocator.unmap(&block);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(block.mapping_refcount(), 0);
    assert!(block.mapped_virt_addr().is_none());

    let driver = allocator.driver();
    assert!(driver.maps() >= 1);
    assert_eq!(driver.maps(), driver.unmaps());
    let stats = allocator.stats();
    assert_eq!(stats.map_syscalls, stats.unmap_syscalls);

    let block = Arc::into_inner(block).unwrap();
    allocator.free(block).unwrap();
}

/// When the first mapper fails, the others still get a mapping.
#[test]
fn test_concurrent_maps_with_failed_first_mapper() {
    const THREADS: usize = 6;

    let allocator = DeviceAllocator::new(
        CountingDriver::with_map_delay(Duration::from_millis(10)),
        AllocatorConfig::default(),
    );
    allocator.driver().fail_next_maps(1);
    let block = allocator.allocate(4096).unwrap();
    let barrier = Barrier::new(THREADS);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    allocator
                        .map(&block, 4096, MapAccess::READ_WRITE)
                        .map(|ptr| ptr.as_ptr() as usize)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let failures = results.iter().filter(|r| r.is_err()).count();
    let addrs: Vec<usize> = results.into_iter().filter_map(Result::ok).collect();
    assert_eq!(failures, 1);
    assert_eq!(addrs.len(), THREADS - 1);
    assert!(addrs.iter().all(|&addr| addr == addrs[0]));
    assert_eq!(block.mapping_refcount(), (THREADS - 1) as u32);
    assert_eq!(allocator.driver().maps(), 2);

    for _ in 0..THREADS - 1 {
        allocator.unmap(&block);
    }
    assert!(!block.is_mapped());
    allocator.free(block).unwrap();
}

/// Allocate and free from many threads through a shared trait object.
#[test]
fn test_concurrent_allocate_free() {
    const THREADS: usize = 4;

    let allocator: Arc<dyn PhysMemAllocator> = Arc::new(counting_allocator());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    let block = allocator.allocate(1 + (t * 50 + i) * 64).unwrap();
                    {
                        let mapping =
                            BlockMapping::new(allocator.as_ref(), &block, MapAccess::WRITE)
                                .unwrap();
                        mapping.write_at(0, &[t as u8]).unwrap();
                    }
                    allocator.free(block).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(allocator.mem_type(), "CountingMemory");
}
