//! Kernel Object Audit Trail
//!
//! This module records every kernel object the simulated kernel creates,
//! aliases or maps, so tests can check what capmgr actually asked for.
//!
//! ## Philosophy
//!
//! - Test-only: This is NOT production logging, it's for test verification
//! - Deterministic: Events are numbered in the order they happened
//! - Queryable: Tests can assert on the trail to verify aliasing properties
//!
//! ## Example
//!
//! ```
//! use sim_kernel::capability_audit::{KernelAuditLog, KernelEvent};
//! use core_types::{ComponentId, ThreadId};
//!
//! let mut audit_log = KernelAuditLog::new();
//! audit_log.record_event(KernelEvent::ThreadCreated {
//!     tid: ThreadId(4),
//!     owner: ComponentId(5),
//! });
//!
//! assert_eq!(audit_log.get_events().len(), 1);
//! ```

use core_types::{ComponentId, Paddr, ThreadId, Vaddr};

/// Something the simulated kernel did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    ComponentCreated {
        id: ComponentId,
        name: String,
    },
    ThreadCreated {
        tid: ThreadId,
        owner: ComponentId,
    },
    ThreadAliased {
        tid: ThreadId,
        into: ComponentId,
        cap: u64,
    },
    RcvCreated {
        owner: ComponentId,
        tid: ThreadId,
    },
    RcvAliased {
        into: ComponentId,
    },
    RcvAliasRevoked {
        from: ComponentId,
    },
    RcvRevoked {
        owner: ComponentId,
        tid: ThreadId,
    },
    AsndCreated {
        target: u64,
    },
    AsndAliased {
        into: ComponentId,
        cap: u64,
    },
    AsndRevoked {
        target: u64,
    },
    FramesReserved {
        first: Paddr,
        count: usize,
    },
    FramesMapped {
        into: ComponentId,
        vaddr: Vaddr,
        count: usize,
    },
    HwMapped {
        into: ComponentId,
        paddr: Paddr,
        size: u64,
    },
    UlkMapped {
        into: ComponentId,
    },
    FaultInjected {
        fault: String,
    },
}

/// A single audit event with its sequence number
#[derive(Debug, Clone)]
pub struct KernelAuditEvent {
    /// Position of the event in the trail
    pub sequence: u64,
    /// The kernel event that occurred
    pub event: KernelEvent,
}

/// Audit log for kernel object operations
#[derive(Debug, Clone, Default)]
pub struct KernelAuditLog {
    events: Vec<KernelAuditEvent>,
}

impl KernelAuditLog {
    /// Creates a new empty audit log
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records an event at the end of the trail
    pub fn record_event(&mut self, event: KernelEvent) {
        let sequence = self.events.len() as u64;
        self.events.push(KernelAuditEvent { sequence, event });
    }

    /// Returns all recorded events
    pub fn get_events(&self) -> &[KernelAuditEvent] {
        &self.events
    }

    /// Returns events that concern a given component
    pub fn get_events_for_component(&self, id: ComponentId) -> Vec<&KernelAuditEvent> {
        self.events
            .iter()
            .filter(|e| match &e.event {
                KernelEvent::ComponentCreated { id: c, .. } => *c == id,
                KernelEvent::ThreadCreated { owner, .. } => *owner == id,
                KernelEvent::ThreadAliased { into, .. } => *into == id,
                KernelEvent::RcvCreated { owner, .. } => *owner == id,
                KernelEvent::RcvAliased { into } => *into == id,
                KernelEvent::RcvAliasRevoked { from } => *from == id,
                KernelEvent::RcvRevoked { owner, .. } => *owner == id,
                KernelEvent::AsndAliased { into, .. } => *into == id,
                KernelEvent::FramesMapped { into, .. } => *into == id,
                KernelEvent::HwMapped { into, .. } => *into == id,
                KernelEvent::UlkMapped { into } => *into == id,
                KernelEvent::AsndCreated { .. }
                | KernelEvent::AsndRevoked { .. }
                | KernelEvent::FramesReserved { .. }
                | KernelEvent::FaultInjected { .. } => false,
            })
            .collect()
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(&e.event)).count()
    }

    /// Checks if any event matches the predicate
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().any(|e| predicate(&e.event))
    }

    /// Clears all events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Returns the number of recorded events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Checks if the audit log is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
