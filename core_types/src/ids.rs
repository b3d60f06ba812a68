//! Identifiers for system entities
//!
//! All identifiers are small integers assigned outside of capmgr (component
//! ids by the image composer, thread ids by the kernel, core ids by the
//! hardware). Zero is reserved as "absent" for component ids, mirroring the
//! manifest's convention.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a component (protection domain)
///
/// Assigned when the system image is composed and never reused while the
/// component is live. The value `0` is never a valid component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(pub u64);

impl ComponentId {
    /// The "no component" sentinel used by manifest lookups
    pub const NONE: ComponentId = ComponentId(0);

    /// Creates a component id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true unless this is the `0` sentinel
    pub const fn is_some(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comp({})", self.0)
    }
}

/// Identifier for a CPU core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(pub usize);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Core({})", self.0)
    }
}

/// Kernel-assigned thread identifier
///
/// Unlike a thread capability, a thread id is not a grant of authority; it
/// only names the thread for introspection and scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thd({})", self.0)
    }
}

/// Index of the closure a new thread starts executing
///
/// Index `0` denotes a component's initial entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryIndex(pub u64);

impl EntryIndex {
    /// The component's initial entry point
    pub const INITIAL: EntryIndex = EntryIndex(0);
}
