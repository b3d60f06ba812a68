//! Kernel error types

use core_types::ComponentId;
use thiserror::Error;

/// Errors reported synchronously by kernel capability primitives
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// No physical frames left to satisfy the request
    #[error("Out of physical memory")]
    OutOfMemory,

    /// The target component's capability table has no free slots
    #[error("Capability table full in {0}")]
    CapabilityTableFull(ComponentId),

    /// The kernel has no record of the component
    #[error("Unknown component: {0}")]
    UnknownComponent(ComponentId),

    /// The shared region is already present in the component's page table
    #[error("Region already mapped in {0}")]
    AlreadyMapped(ComponentId),

    /// A capability slot did not name an object of the expected kind
    #[error("Invalid capability: {0}")]
    InvalidCapability(u64),

    /// The kernel refused the operation
    #[error("Operation rejected: {0}")]
    Rejected(String),
}
