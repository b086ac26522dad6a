//! Reference-counted mapping state of a physical memory block.
//!
//! # Protocol
//!
//! ```text
//!            map (0 -> 1, establish)            map (N -> N+1)
//!   Unmapped ───────────────────────▶ Mapped ◀──────────────┐
//!      ▲                                │ │                 │
//!      │       unmap (1 -> 0, teardown) │ └─────────────────┘
//!      └────────────────────────────────┘   unmap (N -> N-1, N > 1)
//! ```
//!
//! - `refcount` is an atomic counter. Every `acquire` increments it before
//!   anything else, so exactly one caller observes the 0 -> 1 transition.
//! - `region` is guarded by a mutex. The establishing `mmap` and the final
//!   `munmap` both run while it is held, so concurrent first mappers
//!   serialize on the syscall and later mappers see the finished mapping.
//! - Decrements above 1 are lock-free. The decrement that can reach 0 is
//!   done with the mutex held, so a mapper racing the last unmapper either
//!   keeps the mapping alive or starts from a clean `Unmapped` state.
//! - A failed establish returns the caller's reference under the mutex.

use super::MapAccess;
use rustix::io::Errno;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A live virtual mapping of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MappedRegion {
    /// Start of the mapping.
    pub ptr: NonNull<u8>,
    /// Length of the mapping in bytes.
    pub len: usize,
    /// Access the mapping was established with.
    pub access: MapAccess,
}

// SAFETY: The region only describes a process-wide mapping. Access to the
// bytes behind `ptr` is the responsibility of the mapping's users.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Outcome of a successful [`MappingState::acquire`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Acquired {
    /// This caller performed the underlying map.
    Established(MappedRegion),
    /// The mapping already existed.
    Shared(MappedRegion),
}

impl Acquired {
    pub(crate) fn region(&self) -> MappedRegion {
        match self {
            Acquired::Established(region) | Acquired::Shared(region) => *region,
        }
    }
}

/// Outcome of [`MappingState::release`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Release {
    /// Other references remain; count after the decrement.
    Retained(u32),
    /// This caller dropped the last reference and tore the mapping down.
    Unmapped(MappedRegion),
    /// There was no reference to release.
    Unbalanced,
}

/// Mapping refcount and the region it guards.
#[derive(Debug, Default)]
pub(crate) struct MappingState {
    refcount: AtomicU32,
    region: Mutex<Option<MappedRegion>>,
}

impl MappingState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take a mapping reference, establishing the mapping if there is none.
    ///
    /// `establish` runs with the mutex held and only when no mapping exists.
    ///
    /// # Panics
    ///
    /// Panics if `access` asks for write access while the existing mapping
    /// is read-only. The reference taken by this call is returned first, the
    /// same way [`release`](Self::release) returns one: if it was the last,
    /// `teardown` runs before the panic.
    pub(crate) fn acquire<F, T>(
        &self,
        access: MapAccess,
        establish: F,
        teardown: T,
    ) -> Result<Acquired, Errno>
    where
        F: FnOnce() -> Result<MappedRegion, Errno>,
        T: FnOnce(MappedRegion),
    {
        let previous = self.refcount.fetch_add(1, Ordering::AcqRel);
        let mut region = self.lock();

        if let Some(current) = *region {
            if !current.access.permits(access) {
                // Unmappers may have dropped every other reference since
                // the increment above.
                self.release_locked(&mut region, teardown);
                drop(region);
                panic!(
                    "requested {access:?} access to a block mapped with {:?}",
                    current.access
                );
            }
            return Ok(Acquired::Shared(current));
        }

        // previous > 0 here means an earlier first mapper failed and this
        // caller takes over.
        tracing::trace!(previous, "establishing mapping");

        match establish() {
            Ok(mapped) => {
                *region = Some(mapped);
                Ok(Acquired::Established(mapped))
            }
            Err(errno) => {
                self.refcount.fetch_sub(1, Ordering::AcqRel);
                Err(errno)
            }
        }
    }

    /// Drop a mapping reference, tearing the mapping down on the last one.
    ///
    /// `teardown` runs with the mutex held, after the count reached zero.
    /// The mapping is forgotten whatever `teardown` does.
    pub(crate) fn release<F>(&self, teardown: F) -> Release
    where
        F: FnOnce(MappedRegion),
    {
        let mut current = self.refcount.load(Ordering::Acquire);
        while current > 1 {
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Release::Retained(current - 1),
                Err(actual) => current = actual,
            }
        }

        let mut region = self.lock();
        self.release_locked(&mut region, teardown)
    }

    /// Decrement with the mutex held; the decrement reaching zero tears down.
    fn release_locked<F>(&self, region: &mut Option<MappedRegion>, teardown: F) -> Release
    where
        F: FnOnce(MappedRegion),
    {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Release::Unbalanced;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current > 1 {
            return Release::Retained(current - 1);
        }

        match region.take() {
            Some(mapped) => {
                teardown(mapped);
                Release::Unmapped(mapped)
            }
            // A mapper that took over after a failed establish has not run yet.
            None => Release::Retained(0),
        }
    }

    /// Current number of mapping references.
    #[inline]
    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// The current mapping, if any.
    pub(crate) fn region(&self) -> Option<MappedRegion> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<MappedRegion>> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
