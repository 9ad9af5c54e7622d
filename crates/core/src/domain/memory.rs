// Memory Region Model (mmap -> mincore -> munmap)

use nix::sys::mman::{MapFlags, ProtFlags};

/// Parameters of a mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub length: usize,
    pub protection: ProtFlags,
    pub flags: MapFlags,
}

impl MapRequest {
    /// Anonymous, private, read-only mapping
    pub fn anonymous_read_only(length: usize) -> Self {
        Self {
            length,
            protection: ProtFlags::PROT_READ,
            flags: MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        }
    }
}

/// A live mapping returned by the kernel
///
/// Not `Clone`: munmap consumes the region, so it cannot be queried after
/// release.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    base: usize,
    length: usize,
    protection: ProtFlags,
    flags: MapFlags,
}

impl MemoryRegion {
    /// Wrap an address the kernel returned for `request`
    pub fn from_kernel(base: usize, request: &MapRequest) -> Self {
        Self {
            base,
            length: request.length,
            protection: request.protection,
            flags: request.flags,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn protection(&self) -> ProtFlags {
        self.protection
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn is_page_aligned(&self, page_size: usize) -> bool {
        page_size != 0 && self.base % page_size == 0
    }
}

/// Number of residency entries mincore must fill for `length` bytes.
/// Partial pages round up.
pub fn residency_len(length: usize, page_size: usize) -> usize {
    length.div_ceil(page_size)
}
