//! Typed capability-table slots
//!
//! A capability names a kernel object from inside one component's capability
//! table. The same object aliased into two components has two different
//! `Cap` values, one per table.
//!
//! ## Design Principles
//!
//! 1. **Typed**: a thread capability cannot be passed where an endpoint is expected
//! 2. **Table-local**: a `Cap` only means something in the table it was issued for
//! 3. **Null is explicit**: slot `0` is the null capability returned on failure
//!
//! ## Example
//!
//! ```
//! use core_types::{Cap, ThreadObj};
//!
//! let cap: Cap<ThreadObj> = Cap::new(42);
//! assert!(!cap.is_null());
//! assert!(Cap::<ThreadObj>::null().is_null());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// A capability-table slot referencing a kernel object of kind `T`
#[derive(Serialize, Deserialize)]
pub struct Cap<T> {
    /// Slot in the owning component's capability table
    id: u64,
    #[serde(skip)]
    _phantom: PhantomData<T>,
}

impl<T> Cap<T> {
    /// Creates a capability for the given slot
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    /// The null capability (slot 0)
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Returns the slot number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Checks whether this is the null capability
    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl<T> Clone for Cap<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Cap<T> {}

impl<T> PartialEq for Cap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Cap<T> {}

impl<T> fmt::Debug for Cap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap<{}>({})", short_type_name::<T>(), self.id)
    }
}

impl<T> fmt::Display for Cap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap<{}>({})", short_type_name::<T>(), self.id)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Marker: thread object
#[derive(Debug, Clone, Copy)]
pub struct ThreadObj;
/// Marker: receive endpoint object
#[derive(Debug, Clone, Copy)]
pub struct RcvObj;
/// Marker: asynchronous send endpoint object
#[derive(Debug, Clone, Copy)]
pub struct AsndObj;
/// Marker: temporal capability (scheduling budget) object
#[derive(Debug, Clone, Copy)]
pub struct TcapObj;
/// Marker: component object
#[derive(Debug, Clone, Copy)]
pub struct CompObj;
/// Marker: capability-table object
#[derive(Debug, Clone, Copy)]
pub struct CaptblObj;
/// Marker: page-table object
#[derive(Debug, Clone, Copy)]
pub struct PgtblObj;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_creation() {
        let cap: Cap<ThreadObj> = Cap::new(1);
        assert_eq!(cap.id(), 1);
        assert!(!cap.is_null());
    }

    #[test]
    fn test_null_capability() {
        let cap: Cap<RcvObj> = Cap::null();
        assert!(cap.is_null());
        assert_eq!(cap.id(), 0);
    }

    #[test]
    fn test_capability_equality() {
        let cap1: Cap<AsndObj> = Cap::new(1);
        let cap2: Cap<AsndObj> = Cap::new(1);
        let cap3: Cap<AsndObj> = Cap::new(2);

        assert_eq!(cap1, cap2);
        assert_ne!(cap1, cap3);
    }

    #[test]
    fn test_capability_is_copy() {
        let cap: Cap<ThreadObj> = Cap::new(3);
        let copy = cap;
        assert_eq!(cap, copy);
    }

    #[test]
    fn test_capability_display() {
        let cap: Cap<ThreadObj> = Cap::new(42);
        assert_eq!(format!("{}", cap), "Cap<ThreadObj>(42)");
    }

    #[test]
    fn test_capability_serde_roundtrip() {
        let cap: Cap<TcapObj> = Cap::new(17);
        let json = serde_json::to_string(&cap).unwrap();
        let back: Cap<TcapObj> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cap);
    }
}
