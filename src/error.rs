//! Error types for imx-physmem.

use crate::memory::{PhysAddr, PhysMemBlock};
use rustix::io::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using imx-physmem's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for physical memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The kernel device node could not be opened.
    #[error("could not open device {}: {source}", path.display())]
    DeviceOpen {
        /// Path of the device node.
        path: PathBuf,
        /// Underlying OS error.
        source: Errno,
    },

    /// The driver rejected an allocation request.
    #[error("could not allocate {size} bytes of physical memory: {source}")]
    Alloc {
        /// Requested size in bytes.
        size: usize,
        /// Underlying OS error.
        source: Errno,
    },

    /// The driver rejected a release request.
    ///
    /// The state of the physical region is undefined afterwards.
    #[error("could not free physical memory at address {addr}: {source}")]
    Free {
        /// Physical address of the block.
        addr: PhysAddr,
        /// Underlying OS error.
        source: Errno,
    },

    /// Memory-mapping a block failed.
    #[error("memory-mapping physical memory at address {addr} failed: {source}")]
    Map {
        /// Physical address of the block.
        addr: PhysAddr,
        /// Underlying OS error.
        source: Errno,
    },

    /// A block was freed while it still had outstanding mappings.
    ///
    /// The block is handed back; see [`Error::into_block`].
    #[error("physical memory at address {addr} is still mapped ({mappings} mappings)")]
    StillMapped {
        /// Physical address of the block.
        addr: PhysAddr,
        /// Outstanding mapping references.
        mappings: u32,
        /// The block that was not freed.
        block: Box<PhysMemBlock>,
    },

    /// A block was handed to an allocator that did not allocate it.
    #[error("physical memory at address {addr} belongs to another allocator")]
    ForeignBlock {
        /// Physical address of the block.
        addr: PhysAddr,
        /// The block, when the failed call took ownership of it.
        block: Option<Box<PhysMemBlock>>,
    },

    /// A byte range does not fit inside a block.
    #[error("range {offset}+{size} is out of bounds for a block of {len} bytes")]
    OutOfRange {
        /// Start of the range.
        offset: usize,
        /// Length of the range.
        size: usize,
        /// Size of the block.
        len: usize,
    },

    /// No allocator factory is registered under this name.
    #[error("unknown allocator: {0}")]
    UnknownAllocator(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] Errno),
}

impl Error {
    /// The errno-equivalent behind this error, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::DeviceOpen { source, .. }
            | Error::Alloc { source, .. }
            | Error::Free { source, .. }
            | Error::Map { source, .. } => Some(*source),
            Error::System(errno) => Some(*errno),
            Error::Io(err) => Errno::from_io_error(err),
            Error::StillMapped { .. }
            | Error::ForeignBlock { .. }
            | Error::OutOfRange { .. }
            | Error::UnknownAllocator(_) => None,
        }
    }

    /// Take back the block a failed [`free`](crate::memory::PhysMemAllocator::free)
    /// did not release.
    ///
    /// Dropping the error instead leaks the block's device memory.
    pub fn into_block(self) -> Option<PhysMemBlock> {
        match self {
            Error::StillMapped { block, .. } => Some(*block),
            Error::ForeignBlock { block, .. } => block.map(|block| *block),
            _ => None,
        }
    }
}
