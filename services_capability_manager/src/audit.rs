//! capmgr audit trail
//!
//! An ordered record of every object capmgr created, aliased or refused.
//! Operational messages go to the `log` facade; this trail is the
//! structured, queryable counterpart tests assert on.

use crate::init_protocol::InitState;
use core_types::{ComponentId, CoreId, ThreadId, Vaddr};
use spin::Mutex;

/// Something capmgr did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapMgrEvent {
    ComponentCreated {
        id: ComponentId,
        name: String,
    },
    VmCreated {
        id: ComponentId,
        manager: ComponentId,
    },
    ThreadCreated {
        tid: ThreadId,
        client: ComponentId,
        sched: ComponentId,
    },
    /// The thread exists in the kernel but no scheduler holds it
    ThreadAliasLeaked {
        tid: ThreadId,
        client: ComponentId,
        sched: ComponentId,
    },
    InitThreadCreated {
        component: ComponentId,
        core: CoreId,
        tid: ThreadId,
    },
    SchedExecutionCreated {
        component: ComponentId,
        core: CoreId,
    },
    RcvCreated {
        owner: ComponentId,
        tid: ThreadId,
    },
    /// A published endpoint was torn down after its send endpoint failed
    RcvRevoked {
        owner: ComponentId,
        tid: ThreadId,
    },
    AsndCreated {
        owner: ComponentId,
    },
    PagesAllocated {
        component: Option<ComponentId>,
        first_page: u32,
        count: usize,
    },
    PageAliased {
        page: u32,
        into: ComponentId,
        vaddr: Vaddr,
    },
    SpanCreated {
        span: u32,
        pages: usize,
    },
    SpanMapped {
        span: u32,
        into: ComponentId,
        vaddr: Vaddr,
    },
    ContigAllocated {
        component: ComponentId,
        offset: usize,
        count: usize,
    },
    PermissionDenied {
        caller: ComponentId,
        target: ComponentId,
    },
    InitTransition {
        component: ComponentId,
        state: InitState,
    },
    ComponentExited {
        component: ComponentId,
        retval: i32,
    },
}

/// A single audit event with its sequence number
#[derive(Debug, Clone)]
pub struct CapMgrAuditEvent {
    pub sequence: u64,
    pub event: CapMgrEvent,
}

/// Ordered log of capmgr events
#[derive(Debug, Clone, Default)]
pub struct CapMgrAuditLog {
    events: Vec<CapMgrAuditEvent>,
}

impl CapMgrAuditLog {
    /// Creates a new empty audit log
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Records an event
    pub fn record_event(&mut self, event: CapMgrEvent) {
        let sequence = self.events.len() as u64;
        self.events.push(CapMgrAuditEvent { sequence, event });
    }

    /// Returns all recorded events
    pub fn get_events(&self) -> &[CapMgrAuditEvent] {
        &self.events
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CapMgrEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(&e.event)).count()
    }

    /// Checks if any event matches the predicate
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&CapMgrEvent) -> bool,
    {
        self.events.iter().any(|e| predicate(&e.event))
    }

    /// Clears all events
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The audit log shared by every capmgr layer
#[derive(Debug, Default)]
pub struct AuditTrail {
    log: Mutex<CapMgrAuditLog>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: CapMgrEvent) {
        self.log.lock().record_event(event);
    }

    /// Copy of the log as it stands
    pub fn snapshot(&self) -> CapMgrAuditLog {
        self.log.lock().clone()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}
