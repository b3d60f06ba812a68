//! Capability Object Layer
//!
//! Turns a pool slot and a target component into a live kernel object plus
//! its alias. Each constructor reserves its slots first, asks the kernel,
//! and only then publishes; a failure before publication drops the
//! reservation and the slot returns to its pool.
//!
//! ## Philosophy
//!
//! - **Once per request**: constructors are not idempotent. A caller that
//!   sees an error must not retry blindly.
//! - **Deliberate leak on thread aliasing**: the kernel API cannot revoke a
//!   thread. A thread whose alias fails stays published, marked
//!   [`ThreadAlias::AliasFailed`], so the leak is visible rather than silent.

use crate::audit::{AuditTrail, CapMgrEvent};
use crate::error::CapMgrError;
use crate::pool::{Handle, HandlePool};
use crate::CapMgrConfig;
use core_types::{AsndObj, Cap, ComponentId, CoreId, EntryIndex, RcvObj, ThreadId, ThreadObj};
use kernel_api::{
    ComponentResources, KernelApi, KernelAsnd, KernelRcv, KernelThread, RcvAliases, RcvFlags,
};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name given to components created for virtual machines
pub const VM_COMPONENT_NAME: &str = "vmlinux";

/// How capmgr came to know a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// capmgr's own record
    Capmgr,
    /// Booted before capmgr and adopted from the manifest
    Booted,
    /// Created on request; `manager` is the component that asked for it
    VirtualMachine { manager: ComponentId },
}

/// A component record
#[derive(Debug, Clone)]
pub struct CmComponent {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    pub resources: Option<ComponentResources>,
    /// Scheduling endpoint per core; absent on cores where this is not a scheduler
    pub sched_rcvs: BTreeMap<CoreId, Handle<CmRcv>>,
}

impl CmComponent {
    /// The scheduling endpoint on `core`
    pub fn sched_rcv(&self, core: CoreId) -> Result<Handle<CmRcv>, CapMgrError> {
        self.sched_rcvs
            .get(&core)
            .copied()
            .ok_or(CapMgrError::NotScheduler {
                component: self.id,
                core,
            })
    }

    /// The VM manager, for virtual-machine components
    pub fn vm_manager(&self) -> Option<ComponentId> {
        match self.kind {
            ComponentKind::VirtualMachine { manager } => Some(manager),
            _ => None,
        }
    }
}

/// Where a thread's capability ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAlias {
    /// Installed in the scheduler's table at this slot
    Aliased(Cap<ThreadObj>),
    /// A component's initial thread; only capmgr holds it
    Unaliased,
    /// Created, but aliasing into the scheduler failed
    AliasFailed,
}

/// A thread record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmThread {
    pub kernel: KernelThread,
    /// Component the thread begins execution in
    pub client: ComponentId,
    /// Scheduler holding the alias
    pub sched: ComponentId,
    pub alias: ThreadAlias,
}

impl CmThread {
    pub fn tid(&self) -> ThreadId {
        self.kernel.tid
    }
}

/// A receive-endpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmRcv {
    pub kernel: KernelRcv,
    /// Scheduler component owning the endpoint
    pub owner: ComponentId,
    /// Alias in the owner's table; null for scheduling execution contexts
    pub aliased_cap: Cap<RcvObj>,
}

/// A send-endpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmAsnd {
    pub kernel: KernelAsnd,
    pub owner: ComponentId,
    pub aliased_cap: Cap<AsndObj>,
}

/// Result of a successful receive-endpoint creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcvCreated {
    pub rcv: Handle<CmRcv>,
    pub thread: Handle<CmThread>,
    pub aliases: RcvAliases,
    pub tid: ThreadId,
}

/// The component, thread, rcv and asnd pools
pub struct Objects {
    components: HandlePool<CmComponent>,
    threads: HandlePool<CmThread>,
    rcvs: HandlePool<CmRcv>,
    asnds: HandlePool<CmAsnd>,
    audit: Arc<AuditTrail>,
}

impl Objects {
    pub fn new(config: &CapMgrConfig, audit: Arc<AuditTrail>) -> Self {
        Self {
            components: HandlePool::new("comp", config.max_components),
            threads: HandlePool::new("thd", config.max_threads),
            rcvs: HandlePool::new("rcv", config.max_rcvs),
            asnds: HandlePool::new("asnd", config.max_asnds),
            audit,
        }
    }

    fn component_handle(&self, id: ComponentId) -> Result<Handle<CmComponent>, CapMgrError> {
        u32::try_from(id.0)
            .ok()
            .and_then(|index| self.components.handle_at(index))
            .ok_or(CapMgrError::UnknownComponent(id))
    }

    /// Copy of a component record
    pub fn component(&self, id: ComponentId) -> Result<CmComponent, CapMgrError> {
        let handle = self.component_handle(id)?;
        self.components
            .get(handle)
            .ok_or(CapMgrError::UnknownComponent(id))
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.component_handle(id).is_ok()
    }

    pub fn component_count(&self) -> usize {
        self.components.active_count()
    }

    /// Registers a component at its own id
    ///
    /// The kernel-side record is created by `create_in_kernel` after the slot
    /// is reserved; the slot is published only if that succeeds.
    pub fn register_component<F>(
        &self,
        id: ComponentId,
        name: &str,
        kind: ComponentKind,
        resources: Option<ComponentResources>,
        create_in_kernel: F,
    ) -> Result<(), CapMgrError>
    where
        F: FnOnce() -> Result<(), kernel_api::KernelError>,
    {
        let index = u32::try_from(id.0).map_err(|_| CapMgrError::UnknownComponent(id))?;
        let pending = self.components.allocate_at(index)?;
        create_in_kernel().map_err(CapMgrError::Kernel)?;
        pending.activate(CmComponent {
            id,
            name: name.to_string(),
            kind,
            resources,
            sched_rcvs: BTreeMap::new(),
        });
        self.audit.record(CapMgrEvent::ComponentCreated {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Creates a virtual-machine component at a fresh id, managed by `manager`
    pub fn create_vm_component<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        manager: ComponentId,
    ) -> Result<ComponentId, CapMgrError> {
        let pending = self.components.allocate()?;
        let id = ComponentId(u64::from(pending.index()));
        kernel
            .vm_component_create(id, VM_COMPONENT_NAME)
            .map_err(CapMgrError::Kernel)?;
        pending.activate(CmComponent {
            id,
            name: VM_COMPONENT_NAME.to_string(),
            kind: ComponentKind::VirtualMachine { manager },
            resources: None,
            sched_rcvs: BTreeMap::new(),
        });
        self.audit.record(CapMgrEvent::VmCreated { id, manager });
        debug!("capmgr: created VM {} managed by {}", id, manager);
        Ok(id)
    }

    /// Creates a thread executing in `client`, aliased into `sched`
    ///
    /// If the alias fails the thread stays published as
    /// [`ThreadAlias::AliasFailed`] and the error names its tid.
    pub fn create_thread<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        client: ComponentId,
        sched: ComponentId,
        entry: EntryIndex,
    ) -> Result<(Handle<CmThread>, CmThread), CapMgrError> {
        self.component_handle(client)?;
        self.component_handle(sched)?;

        let pending = self.threads.allocate()?;
        let thread = kernel
            .thread_create(client, entry)
            .map_err(CapMgrError::Kernel)?;

        let mut record = CmThread {
            kernel: thread,
            client,
            sched,
            alias: ThreadAlias::AliasFailed,
        };
        match kernel.thread_alias(&thread, sched) {
            Ok(cap) => {
                record.alias = ThreadAlias::Aliased(cap);
                let handle = pending.activate(record);
                self.audit.record(CapMgrEvent::ThreadCreated {
                    tid: thread.tid,
                    client,
                    sched,
                });
                Ok((handle, record))
            }
            Err(err) => {
                pending.activate(record);
                warn!(
                    "capmgr: thread {} in {} could not be aliased into {}: {}",
                    thread.tid, client, sched, err
                );
                self.audit.record(CapMgrEvent::ThreadAliasLeaked {
                    tid: thread.tid,
                    client,
                    sched,
                });
                Err(CapMgrError::ThreadAliasFailed { tid: thread.tid })
            }
        }
    }

    /// Creates the initial thread of `component` on `core`
    pub fn create_init_thread<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        core: CoreId,
    ) -> Result<Handle<CmThread>, CapMgrError> {
        self.component_handle(component)?;
        let pending = self.threads.allocate()?;
        let thread = kernel
            .init_thread_create(component, core)
            .map_err(CapMgrError::Kernel)?;
        let handle = pending.activate(CmThread {
            kernel: thread,
            client: component,
            sched: ComponentId::NONE,
            alias: ThreadAlias::Unaliased,
        });
        self.audit.record(CapMgrEvent::InitThreadCreated {
            component,
            core,
            tid: thread.tid,
        });
        Ok(handle)
    }

    /// Creates the scheduling execution context of `component` on `core`
    ///
    /// The new endpoint becomes the component's scheduling endpoint there.
    pub fn create_sched_execution<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        core: CoreId,
    ) -> Result<Handle<CmRcv>, CapMgrError> {
        let comp = self.component_handle(component)?;
        let pending = self.rcvs.allocate()?;
        let rcv = kernel
            .sched_execution_create(component, core)
            .map_err(CapMgrError::Kernel)?;
        let handle = pending.activate(CmRcv {
            kernel: rcv,
            owner: component,
            aliased_cap: Cap::null(),
        });
        self.components
            .with_mut(comp, |c| c.sched_rcvs.insert(core, handle))
            .ok_or(CapMgrError::UnknownComponent(component))?;
        self.audit
            .record(CapMgrEvent::SchedExecutionCreated { component, core });
        Ok(handle)
    }

    /// Creates a receive endpoint owned by the scheduler `component`
    ///
    /// The endpoint's thread reports to the component's own scheduling
    /// endpoint on `core`. Thread, rcv and tcap are aliased into the
    /// component as a bundle; nothing is published unless all of it worked.
    pub fn create_receive_endpoint<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        core: CoreId,
        entry: EntryIndex,
        flags: RcvFlags,
    ) -> Result<RcvCreated, CapMgrError> {
        let parent = self.component(component)?.sched_rcv(core)?;
        let parent = self
            .rcvs
            .get(parent)
            .ok_or(CapMgrError::NotScheduler { component, core })?;

        let pending_rcv = self.rcvs.allocate()?;
        let pending_thd = self.threads.allocate()?;
        let rcv = kernel
            .rcv_create(component, parent.kernel.rcv, entry, flags)
            .map_err(CapMgrError::Kernel)?;
        let aliases = match kernel.rcv_alias(&rcv, component) {
            Ok(aliases) => aliases,
            Err(err) => {
                kernel.rcv_revoke(&rcv).map_err(CapMgrError::Kernel)?;
                return Err(CapMgrError::Kernel(err));
            }
        };

        let thread = pending_thd.activate(CmThread {
            kernel: rcv.thread,
            client: component,
            sched: component,
            alias: ThreadAlias::Aliased(aliases.thread),
        });
        let handle = pending_rcv.activate(CmRcv {
            kernel: rcv,
            owner: component,
            aliased_cap: aliases.rcv,
        });
        self.audit.record(CapMgrEvent::RcvCreated {
            owner: component,
            tid: rcv.thread.tid,
        });
        Ok(RcvCreated {
            rcv: handle,
            thread,
            aliases,
            tid: rcv.thread.tid,
        })
    }

    /// Creates a send endpoint to `target`, aliased into `component`
    pub fn create_send_endpoint<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        target: Handle<CmRcv>,
    ) -> Result<(Handle<CmAsnd>, Cap<AsndObj>), CapMgrError> {
        let rcv = self
            .rcvs
            .get(target)
            .ok_or(CapMgrError::InvalidArgument("unknown receive endpoint"))?;
        let pending = self.asnds.allocate()?;
        let asnd = kernel.asnd_create(&rcv.kernel).map_err(CapMgrError::Kernel)?;
        let cap = match kernel.asnd_alias(&asnd, component) {
            Ok(cap) => cap,
            Err(err) => {
                kernel.asnd_revoke(&asnd).map_err(CapMgrError::Kernel)?;
                return Err(CapMgrError::Kernel(err));
            }
        };
        let handle = pending.activate(CmAsnd {
            kernel: asnd,
            owner: component,
            aliased_cap: cap,
        });
        self.audit.record(CapMgrEvent::AsndCreated { owner: component });
        Ok((handle, cap))
    }

    /// Tears down a published receive endpoint and its thread
    ///
    /// The owner's aliases go first, then the kernel objects, then the
    /// records. A kernel failure leaves the records published.
    pub fn revoke_receive_endpoint<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        created: &RcvCreated,
    ) -> Result<(), CapMgrError> {
        let rcv = self
            .rcvs
            .get(created.rcv)
            .ok_or(CapMgrError::InvalidArgument("unknown receive endpoint"))?;
        kernel
            .rcv_alias_revoke(&created.aliases, rcv.owner)
            .map_err(CapMgrError::Kernel)?;
        kernel.rcv_revoke(&rcv.kernel).map_err(CapMgrError::Kernel)?;
        self.rcvs.free(created.rcv)?;
        self.threads.free(created.thread)?;
        self.audit.record(CapMgrEvent::RcvRevoked {
            owner: rcv.owner,
            tid: created.tid,
        });
        Ok(())
    }

    /// Slow-path lookup of a thread by its kernel id
    pub fn find_thread_by_tid(&self, tid: ThreadId) -> Option<(Handle<CmThread>, CmThread)> {
        let handle = self.threads.find(|t| t.kernel.tid == tid)?;
        let thread = self.threads.get(handle)?;
        Some((handle, thread))
    }

    pub fn thread(&self, handle: Handle<CmThread>) -> Option<CmThread> {
        self.threads.get(handle)
    }

    pub fn rcv(&self, handle: Handle<CmRcv>) -> Option<CmRcv> {
        self.rcvs.get(handle)
    }

    pub fn asnd(&self, handle: Handle<CmAsnd>) -> Option<CmAsnd> {
        self.asnds.get(handle)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.active_count()
    }

    pub fn rcv_count(&self) -> usize {
        self.rcvs.active_count()
    }

    pub fn asnd_count(&self) -> usize {
        self.asnds.active_count()
    }
}
