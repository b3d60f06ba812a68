//! Image-time configuration
//!
//! Pool capacities and region sizes are fixed when the system image is
//! built. They are carried in one serializable struct so tests and images
//! can pick different sizes without touching the code.

use core_types::{mb_to_pages, ComponentId};
use serde::{Deserialize, Serialize};

/// Number of components a single page may be mapped into at once
pub const MM_MAPPINGS_MAX: usize = 5;

/// Pages reserved for the contiguous physical region
pub const CONTIG_PHY_PAGES: usize = 70_000;

/// Page and span pool capacity (512 MiB worth of pages)
pub const MM_NPAGES: usize = mb_to_pages(512) as usize;

/// Default capacity of the component pool
pub const MAX_NUM_COMPS: usize = 64;

/// Default capacity of the thread, rcv and asnd pools
pub const MAX_NUM_THREADS: usize = 1024;

/// First capability slot the booter leaves free in every table
pub const BOOT_CAPTBL_FREE: u64 = 16;

/// capmgr configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapMgrConfig {
    /// The component capmgr itself runs as
    pub self_id: ComponentId,
    /// Component pool capacity; component ids range over `1..=max_components`
    pub max_components: usize,
    pub max_threads: usize,
    pub max_rcvs: usize,
    pub max_asnds: usize,
    pub max_pages: usize,
    pub max_spans: usize,
    /// Size of the contiguous physical region, in pages
    pub contig_pages: usize,
    /// Number of cores taking part in parallel initialization
    pub num_cores: usize,
    /// The manifest's `captbl_end` must not undercut this slot
    pub captbl_free: u64,
}

impl Default for CapMgrConfig {
    fn default() -> Self {
        Self {
            self_id: ComponentId(2),
            max_components: MAX_NUM_COMPS,
            max_threads: MAX_NUM_THREADS,
            max_rcvs: MAX_NUM_THREADS,
            max_asnds: MAX_NUM_THREADS,
            max_pages: MM_NPAGES,
            max_spans: MM_NPAGES,
            contig_pages: CONTIG_PHY_PAGES,
            num_cores: 1,
            captbl_free: BOOT_CAPTBL_FREE,
        }
    }
}

impl CapMgrConfig {
    /// Small pools, so exhaustion is reachable in tests
    pub fn for_tests() -> Self {
        Self {
            max_components: 32,
            max_threads: 64,
            max_rcvs: 32,
            max_asnds: 32,
            max_pages: 256,
            max_spans: 64,
            contig_pages: 64,
            ..Self::default()
        }
    }

    /// Sets the number of participating cores
    pub fn with_cores(mut self, num_cores: usize) -> Self {
        self.num_cores = num_cores;
        self
    }

    /// Sets capmgr's own component id
    pub fn with_self_id(mut self, id: ComponentId) -> Self {
        self.self_id = id;
        self
    }
}
