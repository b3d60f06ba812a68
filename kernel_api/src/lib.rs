//! # Kernel API
//!
//! This crate defines the interface between the capability manager and the
//! two collaborators it does not implement: the kernel's capability
//! primitives and the scheduler.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Object creation and aliasing (not ownership decisions)
//! - Frame reservation and mapping (not allocation policy)
//! - Page-table introspection (not bookkeeping)
//!
//! ## Design Goals
//!
//! 1. **Testability**: both traits can be implemented in-process
//! 2. **Explicitness**: every primitive names the component it acts on
//! 3. **Type safety**: capabilities are strongly typed
//! 4. **Concurrency**: all methods take `&self` and may run on several cores
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A scheduling policy (run queues live behind [`SchedulerApi`])
//! - A wire format (implementations choose their own transport)

pub mod error;
pub mod kernel;
pub mod sched;

pub use error::KernelError;
pub use kernel::{
    ComponentResources, KernelApi, KernelAsnd, KernelRcv, KernelThread, RcvAliases, RcvFlags,
};
pub use sched::SchedulerApi;
