//! Access flags requested when mapping a block.

use bitflags::bitflags;
use rustix::mm::ProtFlags;

bitflags! {
    /// Access a caller requests for a mapping.
    ///
    /// Mappings are always shared, so writes reach the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapAccess: u32 {
        /// CPU reads.
        const READ = 1 << 0;
        /// CPU writes.
        const WRITE = 1 << 1;
        /// Reads and writes.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MapAccess {
    /// Protection bits for `mmap`.
    #[inline]
    pub fn to_prot(self) -> ProtFlags {
        let mut prot = ProtFlags::empty();
        if self.contains(MapAccess::READ) {
            prot |= ProtFlags::READ;
        }
        if self.contains(MapAccess::WRITE) {
            prot |= ProtFlags::WRITE;
        }
        prot
    }

    /// Whether an established mapping with these flags can serve `requested`.
    ///
    /// A write request is never served by a mapping made without write access.
    #[inline]
    pub fn permits(self, requested: MapAccess) -> bool {
        self.contains(MapAccess::WRITE) || !requested.contains(MapAccess::WRITE)
    }
}
