//! # Simulated Kernel
//!
//! This crate provides a simulated implementation of the kernel capability
//! primitives capmgr is built on.
//!
//! ## Purpose
//!
//! The simulated kernel allows testing capmgr without hardware:
//! - Runs under `cargo test`
//! - Deterministic (capability slots, thread ids and frames are handed out in order)
//! - Safe to call from several threads, like the real per-core invocation paths
//! - Inspectable (page tables, capability frontiers and an audit trail)
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.**
//!
//! capmgr is the one place in the system where capability bookkeeping,
//! page aliasing and physical contiguity meet. Each of those can be
//! checked here against what the kernel was actually asked to do.
//!
//! This is not a "toy" or "mock" - it keeps real per-component page tables
//! and capability tables that happen to live in-process.

pub mod capability_audit;
pub mod fault_injection;
pub mod scheduler;

pub use scheduler::{SchedEvent, SimulatedScheduler};

use capability_audit::{KernelAuditLog, KernelEvent};
use core_types::{
    bytes_to_pages, AsndObj, Cap, ComponentId, CoreId, EntryIndex, Paddr, RcvObj, ThreadId,
    ThreadObj, Vaddr, PAGE_SIZE,
};
use fault_injection::{FaultInjector, FaultPlan, KernelFault};
use kernel_api::{
    ComponentResources, KernelApi, KernelAsnd, KernelError, KernelRcv, KernelThread, RcvAliases,
    RcvFlags,
};
use spin::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Layout of the simulated machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Physical address of the first allocatable frame
    pub phys_base: Paddr,
    /// Number of allocatable frames
    pub phys_frames: usize,
    /// Where a component's heap starts when the manifest gives no frontier
    pub heap_base: Vaddr,
    /// First free capability slot of a component without a known frontier
    pub captbl_base: u64,
    /// Capability slots per component
    pub captbl_size: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            phys_base: Paddr(0x0100_0000),
            phys_frames: 1 << 18,
            heap_base: Vaddr(0x4000_0000),
            captbl_base: 16,
            captbl_size: 1 << 16,
        }
    }
}

/// One component as the kernel sees it
#[derive(Debug, Clone)]
struct SimComponent {
    name: String,
    heap_frontier: u64,
    captbl_frontier: u64,
    captbl_limit: u64,
    /// Slots handed out by this kernel and not yet revoked
    live_caps: BTreeSet<u64>,
    /// Virtual page number -> physical page
    pages: BTreeMap<u64, Paddr>,
    ulk_mapped: bool,
    is_vm: bool,
}

impl SimComponent {
    fn new(name: &str, heap_frontier: u64, captbl_frontier: u64, config: &SimConfig) -> Self {
        Self {
            name: name.to_string(),
            heap_frontier,
            captbl_frontier,
            captbl_limit: captbl_frontier + config.captbl_size,
            live_caps: BTreeSet::new(),
            pages: BTreeMap::new(),
            ulk_mapped: false,
            is_vm: false,
        }
    }
}

struct KernelState {
    components: BTreeMap<ComponentId, SimComponent>,
    /// Thread id -> component it executes in
    threads: BTreeMap<ThreadId, ComponentId>,
    next_tid: u64,
    next_frame: usize,
    ulk_ready: bool,
    faults: FaultInjector,
    audit: KernelAuditLog,
}

/// Simulated kernel
///
/// `self_id` is the component capmgr runs as; objects capmgr creates land
/// in its capability table first and are then aliased elsewhere.
pub struct SimulatedKernel {
    self_id: ComponentId,
    config: SimConfig,
    state: Mutex<KernelState>,
}

impl SimulatedKernel {
    /// Creates a kernel whose capmgr component is `self_id`
    pub fn new(self_id: ComponentId) -> Self {
        Self::with_config(self_id, SimConfig::default())
    }

    /// Creates a kernel with an explicit machine layout
    pub fn with_config(self_id: ComponentId, config: SimConfig) -> Self {
        let mut components = BTreeMap::new();
        components.insert(
            self_id,
            SimComponent::new("capmgr", config.heap_base.0, config.captbl_base, &config),
        );
        Self {
            self_id,
            config,
            state: Mutex::new(KernelState {
                components,
                threads: BTreeMap::new(),
                next_tid: 1,
                next_frame: 0,
                ulk_ready: false,
                faults: FaultInjector::default(),
                audit: KernelAuditLog::new(),
            }),
        }
    }

    /// Arms a fault plan; faults fire one by one on matching calls
    pub fn with_fault_plan(self, plan: FaultPlan) -> Self {
        self.state.lock().faults = FaultInjector::new(plan);
        self
    }

    /// The component capmgr runs as
    pub fn self_id(&self) -> ComponentId {
        self.self_id
    }

    /// Returns a snapshot of the audit trail
    pub fn audit_log(&self) -> KernelAuditLog {
        self.state.lock().audit.clone()
    }

    /// Number of frames handed out so far
    pub fn frames_reserved(&self) -> usize {
        self.state.lock().next_frame
    }

    /// Number of pages present in `component`'s page table
    pub fn mapped_pages(&self, component: ComponentId) -> usize {
        self.state
            .lock()
            .components
            .get(&component)
            .map_or(0, |c| c.pages.len())
    }

    /// Whether the user-level-kernel region is mapped in `component`
    pub fn is_ulk_mapped(&self, component: ComponentId) -> bool {
        self.state
            .lock()
            .components
            .get(&component)
            .is_some_and(|c| c.ulk_mapped)
    }

    /// Whether the kernel knows `component`
    pub fn has_component(&self, component: ComponentId) -> bool {
        self.state.lock().components.contains_key(&component)
    }

    /// Whether `component` was created as a virtual machine
    pub fn is_vm(&self, component: ComponentId) -> bool {
        self.state
            .lock()
            .components
            .get(&component)
            .is_some_and(|c| c.is_vm)
    }

    /// Registered name of `component`
    pub fn component_name(&self, component: ComponentId) -> Option<String> {
        self.state
            .lock()
            .components
            .get(&component)
            .map(|c| c.name.clone())
    }

    /// Whether `slot` in `component`'s table holds a capability this kernel installed
    pub fn holds_cap(&self, component: ComponentId, slot: u64) -> bool {
        self.state
            .lock()
            .components
            .get(&component)
            .is_some_and(|c| c.live_caps.contains(&slot))
    }

    /// Component a thread executes in
    pub fn thread_owner(&self, tid: ThreadId) -> Option<ComponentId> {
        self.state.lock().threads.get(&tid).copied()
    }

    /// Number of faults that have fired
    pub fn faults_fired(&self) -> usize {
        self.state.lock().faults.fired()
    }
}

impl KernelState {
    fn component_mut(&mut self, id: ComponentId) -> Result<&mut SimComponent, KernelError> {
        self.components
            .get_mut(&id)
            .ok_or(KernelError::UnknownComponent(id))
    }

    fn alloc_cap(&mut self, into: ComponentId) -> Result<u64, KernelError> {
        let comp = self.component_mut(into)?;
        if comp.captbl_frontier >= comp.captbl_limit {
            return Err(KernelError::CapabilityTableFull(into));
        }
        let slot = comp.captbl_frontier;
        comp.captbl_frontier += 1;
        comp.live_caps.insert(slot);
        Ok(slot)
    }

    /// Empties `slots` in `from`'s table; all of them must be live
    fn revoke_caps(&mut self, from: ComponentId, slots: &[u64]) -> Result<(), KernelError> {
        let comp = self.component_mut(from)?;
        if let Some(dead) = slots.iter().find(|s| !comp.live_caps.contains(s)) {
            return Err(KernelError::InvalidCapability(*dead));
        }
        for slot in slots {
            comp.live_caps.remove(slot);
        }
        Ok(())
    }

    fn inject(&mut self, fault: KernelFault) -> bool {
        if self.faults.take(fault) {
            self.audit.record_event(KernelEvent::FaultInjected {
                fault: format!("{:?}", fault),
            });
            true
        } else {
            false
        }
    }

    fn new_thread(
        &mut self,
        self_id: ComponentId,
        owner: ComponentId,
    ) -> Result<KernelThread, KernelError> {
        self.component_mut(owner)?;
        let cap = self.alloc_cap(self_id)?;
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        self.threads.insert(tid, owner);
        self.audit
            .record_event(KernelEvent::ThreadCreated { tid, owner });
        Ok(KernelThread {
            cap: Cap::new(cap),
            tid,
            owner,
        })
    }

    fn new_rcv(
        &mut self,
        self_id: ComponentId,
        owner: ComponentId,
    ) -> Result<KernelRcv, KernelError> {
        let thread = self.new_thread(self_id, owner)?;
        let rcv = self.alloc_cap(self_id)?;
        let tcap = self.alloc_cap(self_id)?;
        self.audit.record_event(KernelEvent::RcvCreated {
            owner,
            tid: thread.tid,
        });
        Ok(KernelRcv {
            rcv: Cap::new(rcv),
            thread,
            tcap: Cap::new(tcap),
            owner,
        })
    }
}

impl KernelApi for SimulatedKernel {
    fn component_create(
        &self,
        id: ComponentId,
        name: &str,
        resources: Option<&ComponentResources>,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let exists = state.components.contains_key(&id);
        match (exists, resources) {
            // The booter created capmgr's own record; adopting it only names it
            (true, None) => {
                state.component_mut(id)?.name = name.to_string();
            }
            (true, Some(_)) => {
                return Err(KernelError::Rejected(format!("{} already exists", id)));
            }
            (false, resources) => {
                let heap = resources
                    .map(|r| r.heap_frontier.0)
                    .filter(|h| *h != 0)
                    .unwrap_or(self.config.heap_base.0);
                let captbl = resources
                    .map(|r| r.captbl_frontier)
                    .filter(|c| *c != 0)
                    .unwrap_or(self.config.captbl_base);
                state
                    .components
                    .insert(id, SimComponent::new(name, heap, captbl, &self.config));
            }
        }
        state.audit.record_event(KernelEvent::ComponentCreated {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    fn vm_component_create(&self, id: ComponentId, name: &str) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.components.contains_key(&id) {
            return Err(KernelError::Rejected(format!("{} already exists", id)));
        }
        let mut comp = SimComponent::new(
            name,
            self.config.heap_base.0,
            self.config.captbl_base,
            &self.config,
        );
        comp.is_vm = true;
        state.components.insert(id, comp);
        state.audit.record_event(KernelEvent::ComponentCreated {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    fn thread_create(
        &self,
        owner: ComponentId,
        _entry: EntryIndex,
    ) -> Result<KernelThread, KernelError> {
        let mut state = self.state.lock();
        if state.inject(KernelFault::FailThreadCreate) {
            return Err(KernelError::Rejected("thread creation failed".to_string()));
        }
        state.new_thread(self.self_id, owner)
    }

    fn thread_alias(
        &self,
        thread: &KernelThread,
        into: ComponentId,
    ) -> Result<Cap<ThreadObj>, KernelError> {
        let mut state = self.state.lock();
        if state.inject(KernelFault::FailThreadAlias) {
            return Err(KernelError::Rejected("thread alias failed".to_string()));
        }
        if !state.threads.contains_key(&thread.tid) {
            return Err(KernelError::InvalidCapability(thread.cap.id()));
        }
        let cap = state.alloc_cap(into)?;
        state.audit.record_event(KernelEvent::ThreadAliased {
            tid: thread.tid,
            into,
            cap,
        });
        Ok(Cap::new(cap))
    }

    fn rcv_create(
        &self,
        owner: ComponentId,
        _parent: Cap<RcvObj>,
        _entry: EntryIndex,
        _flags: RcvFlags,
    ) -> Result<KernelRcv, KernelError> {
        let mut state = self.state.lock();
        if state.inject(KernelFault::FailRcvCreate) {
            return Err(KernelError::Rejected("rcv creation failed".to_string()));
        }
        state.new_rcv(self.self_id, owner)
    }

    fn rcv_alias(&self, rcv: &KernelRcv, into: ComponentId) -> Result<RcvAliases, KernelError> {
        let mut state = self.state.lock();
        if state.inject(KernelFault::FailRcvAlias) {
            return Err(KernelError::Rejected("rcv alias failed".to_string()));
        }
        if !state.threads.contains_key(&rcv.thread.tid) {
            return Err(KernelError::InvalidCapability(rcv.rcv.id()));
        }
        let thread = state.alloc_cap(into)?;
        let rcv_cap = state.alloc_cap(into)?;
        let tcap = state.alloc_cap(into)?;
        state.audit.record_event(KernelEvent::RcvAliased { into });
        Ok(RcvAliases {
            thread: Cap::new(thread),
            rcv: Cap::new(rcv_cap),
            tcap: Cap::new(tcap),
        })
    }

    fn rcv_alias_revoke(
        &self,
        aliases: &RcvAliases,
        from: ComponentId,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.revoke_caps(
            from,
            &[aliases.thread.id(), aliases.rcv.id(), aliases.tcap.id()],
        )?;
        state
            .audit
            .record_event(KernelEvent::RcvAliasRevoked { from });
        Ok(())
    }

    fn rcv_revoke(&self, rcv: &KernelRcv) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if !state.threads.contains_key(&rcv.thread.tid) {
            return Err(KernelError::InvalidCapability(rcv.rcv.id()));
        }
        state.revoke_caps(
            self.self_id,
            &[rcv.thread.cap.id(), rcv.rcv.id(), rcv.tcap.id()],
        )?;
        state.threads.remove(&rcv.thread.tid);
        state.audit.record_event(KernelEvent::RcvRevoked {
            owner: rcv.owner,
            tid: rcv.thread.tid,
        });
        Ok(())
    }

    fn asnd_create(&self, rcv: &KernelRcv) -> Result<KernelAsnd, KernelError> {
        let mut state = self.state.lock();
        let cap = state.alloc_cap(self.self_id)?;
        state.audit.record_event(KernelEvent::AsndCreated {
            target: rcv.rcv.id(),
        });
        Ok(KernelAsnd {
            cap: Cap::new(cap),
            target: rcv.rcv,
        })
    }

    fn asnd_alias(
        &self,
        _asnd: &KernelAsnd,
        into: ComponentId,
    ) -> Result<Cap<AsndObj>, KernelError> {
        let mut state = self.state.lock();
        if state.inject(KernelFault::FailAsndAlias) {
            return Err(KernelError::Rejected("asnd alias failed".to_string()));
        }
        let cap = state.alloc_cap(into)?;
        state
            .audit
            .record_event(KernelEvent::AsndAliased { into, cap });
        Ok(Cap::new(cap))
    }

    fn asnd_revoke(&self, asnd: &KernelAsnd) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        state.revoke_caps(self.self_id, &[asnd.cap.id()])?;
        state.audit.record_event(KernelEvent::AsndRevoked {
            target: asnd.target.id(),
        });
        Ok(())
    }

    fn sched_execution_create(
        &self,
        component: ComponentId,
        _core: CoreId,
    ) -> Result<KernelRcv, KernelError> {
        let mut state = self.state.lock();
        state.new_rcv(self.self_id, component)
    }

    fn init_thread_create(
        &self,
        component: ComponentId,
        _core: CoreId,
    ) -> Result<KernelThread, KernelError> {
        let mut state = self.state.lock();
        state.new_thread(self.self_id, component)
    }

    fn frames_reserve(&self, count: usize) -> Result<Paddr, KernelError> {
        let mut state = self.state.lock();
        if count == 0 {
            return Err(KernelError::Rejected("empty frame reservation".to_string()));
        }
        if state.inject(KernelFault::FailFrameReserve)
            || state.next_frame + count > self.config.phys_frames
        {
            return Err(KernelError::OutOfMemory);
        }
        let first = self.config.phys_base.add_pages(state.next_frame as u64);
        state.next_frame += count;
        state
            .audit
            .record_event(KernelEvent::FramesReserved { first, count });
        Ok(first)
    }

    fn frames_alias(
        &self,
        first: Paddr,
        count: usize,
        align: u64,
        into: ComponentId,
    ) -> Result<Vaddr, KernelError> {
        let mut state = self.state.lock();
        let reserved_end = self.config.phys_base.add_pages(state.next_frame as u64);
        let end = first.add_pages(count as u64);
        if first.0 < self.config.phys_base.0 || end.0 > reserved_end.0 {
            return Err(KernelError::InvalidCapability(first.0));
        }
        let gap = count > 1 && state.inject(KernelFault::DiscontiguousAlias);

        let comp = state.component_mut(into)?;
        let vaddr = Vaddr(comp.heap_frontier).align_up(align);
        for i in 0..count as u64 {
            let mut frame = first.add_pages(i);
            if gap && i + 1 == count as u64 {
                frame = frame.add_pages(1);
            }
            comp.pages.insert(vaddr.0 / PAGE_SIZE + i, frame);
        }
        comp.heap_frontier = vaddr.add_pages(count as u64).0;
        state.audit.record_event(KernelEvent::FramesMapped {
            into,
            vaddr,
            count,
        });
        Ok(vaddr)
    }

    fn translate(&self, component: ComponentId, vaddr: Vaddr) -> Option<Paddr> {
        let state = self.state.lock();
        let comp = state.components.get(&component)?;
        let frame = comp.pages.get(&(vaddr.0 / PAGE_SIZE))?;
        Some(Paddr(frame.0 + vaddr.0 % PAGE_SIZE))
    }

    fn hw_map(
        &self,
        component: ComponentId,
        paddr: Paddr,
        size: u64,
    ) -> Result<Vaddr, KernelError> {
        if size == 0 {
            return Err(KernelError::Rejected("empty hardware mapping".to_string()));
        }
        let end = paddr.0.checked_add(size);
        if end.and_then(|e| e.checked_add(PAGE_SIZE)).is_none() {
            return Err(KernelError::Rejected(
                "hardware mapping wraps the address space".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let offset = paddr.0 % PAGE_SIZE;
        let base = Paddr(paddr.0 - offset);
        let count = bytes_to_pages(size + offset);

        let comp = state.component_mut(component)?;
        let vaddr = Vaddr(comp.heap_frontier).align_up(PAGE_SIZE);
        for i in 0..count {
            comp.pages.insert(vaddr.0 / PAGE_SIZE + i, base.add_pages(i));
        }
        comp.heap_frontier = vaddr.add_pages(count).0;
        state.audit.record_event(KernelEvent::HwMapped {
            into: component,
            paddr,
            size,
        });
        Ok(Vaddr(vaddr.0 + offset))
    }

    fn ulk_init(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.ulk_ready {
            return Err(KernelError::AlreadyMapped(self.self_id));
        }
        state.ulk_ready = true;
        Ok(())
    }

    fn ulk_map_in(&self, component: ComponentId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if !state.ulk_ready {
            return Err(KernelError::Rejected(
                "user-level-kernel region not created".to_string(),
            ));
        }
        let comp = state.component_mut(component)?;
        if comp.ulk_mapped {
            return Err(KernelError::AlreadyMapped(component));
        }
        comp.ulk_mapped = true;
        state
            .audit
            .record_event(KernelEvent::UlkMapped { into: component });
        Ok(())
    }
}
