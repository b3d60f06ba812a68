//! # Memory Types
//!
//! Address newtypes and page arithmetic shared by capmgr and the kernel API.
//!
//! ## Philosophy
//!
//! - **Virtual and physical addresses are different types**
//! - **Alignment is checked, not assumed**
//! - **`0` is the failure sentinel at the invocation boundary, never a valid mapping**

use serde::{Deserialize, Serialize};
use std::fmt;

/// Native page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Rounds `bytes` up to the next page boundary
pub const fn round_up_to_page(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to hold `bytes`
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    round_up_to_page(bytes) / PAGE_SIZE
}

/// Number of pages in `mb` mebibytes
pub const fn mb_to_pages(mb: u64) -> u64 {
    bytes_to_pages(mb * 1024 * 1024)
}

/// A virtual address inside some component's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vaddr(pub u64);

impl Vaddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `pages` pages above this one
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }

    /// Checks `self mod align == 0`
    pub fn is_aligned(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }

    /// Rounds up to `align` (which must be a power of two)
    pub fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }
}

impl fmt::Display for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{:#x}", self.0)
    }
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Paddr(pub u64);

impl Paddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address `pages` frames above this one
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0 + pages * PAGE_SIZE)
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p:{:#x}", self.0)
    }
}

/// Checks `addr mod align == 0`; an alignment of `0` is treated as `1`
pub fn is_aligned(addr: u64, align: u64) -> bool {
    align <= 1 || addr % align == 0
}

/// Rounds `addr` up to a multiple of `align`
///
/// Alignments smaller than a page are raised to a page: mappings are never
/// finer than the native page size.
pub fn align_up(addr: u64, align: u64) -> u64 {
    let align = align.max(PAGE_SIZE);
    addr.div_ceil(align) * align
}
