//! # Core Types
//!
//! This crate defines the fundamental types shared by the capability manager,
//! the kernel API it drives, and the simulated kernel used in tests.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: capabilities are typed and cannot be confused.
//! - **Integers, not pointers**: every entity is named by a small id.
//! - **Sentinels at the boundary only**: `0` means "absent" or "failed" when it
//!   crosses a component boundary, and nowhere else.
//!
//! ## Key Types
//!
//! - [`Cap<T>`]: a typed capability-table slot
//! - [`ComponentId`], [`CoreId`], [`ThreadId`]: entity identifiers
//! - [`Vaddr`], [`Paddr`]: virtual and physical addresses

pub mod capability;
pub mod ids;
pub mod memory;

pub use capability::{AsndObj, Cap, CaptblObj, CompObj, PgtblObj, RcvObj, TcapObj, ThreadObj};
pub use ids::{ComponentId, CoreId, EntryIndex, ThreadId};
pub use memory::{
    align_up, bytes_to_pages, is_aligned, mb_to_pages, round_up_to_page, Paddr, Vaddr, PAGE_SIZE,
};
