//! # Capability Manager Service
//!
//! capmgr owns the capabilities of every component booted before it and
//! creates execution and memory on their behalf.
//!
//! ## Philosophy
//!
//! Components never touch kernel objects directly. They ask capmgr, and
//! capmgr decides whether the caller may have what it asks for:
//! - Threads only for the caller's scheduled clients (or its VMs)
//! - Memory only for the caller itself
//! - Sharing only through spans, never through raw frames
//!
//! Resource pressure is ordinary and reported to the caller. A broken
//! system invariant stops the service.
//!
//! ## Layers
//!
//! - [`pool`]: fixed-capacity generational handle pools
//! - [`objects`]: components, threads and endpoints over the kernel API
//! - [`memory`]: pages, spans and the contiguous region
//! - [`orchestrator`]: boot from the manifest and per-core execution setup
//! - [`init_protocol`]: the component initialization state machine
//! - [`invocation`]: the request surface other components call

pub mod audit;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod init_protocol;
pub mod invocation;
pub mod memory;
pub mod objects;
pub mod orchestrator;
pub mod pool;

pub use audit::{AuditTrail, CapMgrAuditEvent, CapMgrAuditLog, CapMgrEvent};
pub use config::{CapMgrConfig, MM_MAPPINGS_MAX};
pub use error::{CapMgrError, FatalDefect, PoolError, ServiceHalt};
pub use hierarchy::SchedulerHierarchy;
pub use init_protocol::{InitMain, InitOutcome, InitRegistry, InitState};
pub use invocation::{CapMgrRequest, CapMgrResponse, InvocationContext, ReceiveEndpoint};
pub use memory::{Mapping, MemoryManager, MmPage, MmSpan, PageHandle};
pub use objects::{CmComponent, CmThread, ComponentKind, Objects, ThreadAlias};
pub use orchestrator::CapabilityManager;
pub use pool::{Handle, HandlePool, Reservation};
