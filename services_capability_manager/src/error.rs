//! Error types
//!
//! Two disjoint classes. [`CapMgrError`]'s ordinary variants are resource
//! conditions a client can see and react to; they become sentinel replies
//! at the invocation surface. [`FatalDefect`] means the system was booted
//! inconsistently and capmgr must stop serving.

use core_types::{ComponentId, CoreId, Paddr, ThreadId, Vaddr};
use kernel_api::KernelError;
use manifest::ManifestError;
use thiserror::Error;

/// A handle pool could not satisfy a request
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{pool} pool exhausted")]
    Exhausted { pool: &'static str },

    #[error("{pool} pool has no slot {index}")]
    OutOfRange { pool: &'static str, index: u32 },

    #[error("{pool} slot {index} is already in use")]
    Occupied { pool: &'static str, index: u32 },

    #[error("stale {pool} handle {index}")]
    Stale { pool: &'static str, index: u32 },
}

/// Broken system invariant; no safe continuation exists
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalDefect {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("captbl_end {captbl_end} below the first free slot {captbl_free}")]
    CaptblEndTooLow { captbl_end: u64, captbl_free: u64 },

    #[error("No name for {0} in the manifest")]
    MissingName(ComponentId),

    #[error("{0} is referenced by the manifest but has no record")]
    ComponentMissing(ComponentId),

    #[error("capmgr cannot create execution in itself ({0})")]
    SelfExecution(ComponentId),

    #[error("Physical memory not contiguous at {vaddr} in {component}: expected {expected}, found {found:?}")]
    ContiguityViolation {
        component: ComponentId,
        vaddr: Vaddr,
        expected: Paddr,
        found: Option<Paddr>,
    },

    #[error("Span {span} is not physically contiguous at page {page}")]
    SpanNotContiguous { span: u32, page: u32 },

    #[error("Kernel primitive failed: {0}")]
    Kernel(KernelError),

    #[error("Pool failure during initialization: {0}")]
    Pool(PoolError),
}

/// Errors returned by capmgr operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapMgrError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Out of physical memory")]
    OutOfMemory,

    #[error("All mapping slots in use for page {page}")]
    MappingsExhausted { page: u32 },

    #[error("Contiguous region exhausted: requested {requested}, {remaining} left")]
    ContigExhausted { requested: usize, remaining: usize },

    #[error("Unknown component: {0}")]
    UnknownComponent(ComponentId),

    #[error("Unknown span: {0}")]
    UnknownSpan(u32),

    #[error("Span {requested} was assigned id {assigned}")]
    SpanIdMismatch { requested: u32, assigned: u32 },

    #[error("{caller} may not act on {target}")]
    PermissionDenied {
        caller: ComponentId,
        target: ComponentId,
    },

    #[error("{component} is not a scheduler on {core}")]
    NotScheduler { component: ComponentId, core: CoreId },

    #[error("Thread {tid} created but could not be aliased")]
    ThreadAliasFailed { tid: ThreadId },

    #[error("Address {vaddr} not mapped in {component}")]
    NotMapped {
        component: ComponentId,
        vaddr: Vaddr,
    },

    #[error("{0} has no initialization in progress")]
    InitNotStarted(ComponentId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Kernel refused request: {0}")]
    Kernel(KernelError),

    #[error("Fatal: {0}")]
    Fatal(FatalDefect),
}

impl CapMgrError {
    /// Whether this error must halt the service
    pub fn is_fatal(&self) -> bool {
        matches!(self, CapMgrError::Fatal(_))
    }

    /// Separates fatal defects from recoverable conditions
    pub fn into_defect(self) -> Result<CapMgrError, FatalDefect> {
        match self {
            CapMgrError::Fatal(defect) => Err(defect),
            other => Ok(other),
        }
    }
}

impl From<FatalDefect> for CapMgrError {
    fn from(defect: FatalDefect) -> Self {
        CapMgrError::Fatal(defect)
    }
}

impl From<CapMgrError> for FatalDefect {
    /// Used on boot paths, where every failure is a defect
    fn from(err: CapMgrError) -> Self {
        match err {
            CapMgrError::Fatal(defect) => defect,
            CapMgrError::Pool(pool) => FatalDefect::Pool(pool),
            CapMgrError::Kernel(kernel) => FatalDefect::Kernel(kernel),
            CapMgrError::OutOfMemory => FatalDefect::Kernel(KernelError::OutOfMemory),
            CapMgrError::UnknownComponent(id) => FatalDefect::ComponentMissing(id),
            other => FatalDefect::Kernel(KernelError::Rejected(other.to_string())),
        }
    }
}

/// The service stopped on a fatal defect
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("capmgr halted after {served} requests: {defect}")]
pub struct ServiceHalt {
    /// Requests answered before the halt
    pub served: usize,
    pub defect: FatalDefect,
}
