//! Kernel API trait and kernel-object descriptors

use crate::KernelError;
use core_types::{
    AsndObj, Cap, CaptblObj, CompObj, ComponentId, CoreId, EntryIndex, Paddr, PgtblObj, RcvObj,
    TcapObj, ThreadId, ThreadObj, Vaddr,
};
use serde::{Deserialize, Serialize};

/// Capabilities and frontiers of a component booted before capmgr ran
///
/// capmgr does not create these components; it adopts them by replaying the
/// manifest's capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentResources {
    /// Component capability (in capmgr's table)
    pub comp: Cap<CompObj>,
    /// Capability-table capability (in capmgr's table)
    pub captbl: Cap<CaptblObj>,
    /// Page-table capability (in capmgr's table)
    pub pgtbl: Cap<PgtblObj>,
    /// First unused virtual address in the component
    pub heap_frontier: Vaddr,
    /// First unused capability-table slot in the component
    pub captbl_frontier: u64,
}

/// A thread the kernel created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelThread {
    /// Capability to the thread in capmgr's own table
    pub cap: Cap<ThreadObj>,
    /// Kernel thread id
    pub tid: ThreadId,
    /// Component the thread executes in
    pub owner: ComponentId,
}

/// A receive endpoint, together with its implicit thread and tcap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRcv {
    /// Capability to the endpoint in capmgr's own table
    pub rcv: Cap<RcvObj>,
    /// The thread that runs when the endpoint is activated
    pub thread: KernelThread,
    /// Scheduling budget bound to the thread
    pub tcap: Cap<TcapObj>,
    /// Scheduler component that owns the endpoint
    pub owner: ComponentId,
}

/// The capabilities installed in a component when a receive endpoint is aliased
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcvAliases {
    pub thread: Cap<ThreadObj>,
    pub rcv: Cap<RcvObj>,
    pub tcap: Cap<TcapObj>,
}

/// An asynchronous send endpoint bound to a receive endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAsnd {
    /// Capability to the send endpoint in capmgr's own table
    pub cap: Cap<AsndObj>,
    /// The receive endpoint notifications are delivered to
    pub target: Cap<RcvObj>,
}

/// Flags passed through to receive-endpoint creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RcvFlags(pub u32);

/// The kernel capability primitives capmgr is built on
///
/// Every call either succeeds or fails synchronously. Implementations must
/// be callable from several cores at once, hence `&self` and `Sync`.
///
/// Multiple implementations are possible:
/// - Simulated kernel (for testing)
/// - Real kernel (capability invocations)
///
/// # Example
///
/// ```
/// use core_types::{ComponentId, EntryIndex};
/// use kernel_api::{KernelApi, KernelError};
///
/// fn spawn_in<K: KernelApi>(kernel: &K, owner: ComponentId, sched: ComponentId) -> Result<(), KernelError> {
///     let thread = kernel.thread_create(owner, EntryIndex::INITIAL)?;
///     let _alias = kernel.thread_alias(&thread, sched)?;
///     Ok(())
/// }
/// ```
pub trait KernelApi: Send + Sync {
    /// Registers a component with the kernel
    ///
    /// `resources` is `None` for capmgr's own record, which the booter
    /// created.
    fn component_create(
        &self,
        id: ComponentId,
        name: &str,
        resources: Option<&ComponentResources>,
    ) -> Result<(), KernelError>;

    /// Creates an empty virtual-machine component
    fn vm_component_create(&self, id: ComponentId, name: &str) -> Result<(), KernelError>;

    /// Creates a thread that will execute in `owner`
    fn thread_create(&self, owner: ComponentId, entry: EntryIndex)
        -> Result<KernelThread, KernelError>;

    /// Installs a capability to `thread` in `into`'s table
    fn thread_alias(
        &self,
        thread: &KernelThread,
        into: ComponentId,
    ) -> Result<Cap<ThreadObj>, KernelError>;

    /// Creates a receive endpoint, its thread and its tcap in `owner`
    ///
    /// `parent` is the scheduler endpoint the new thread reports to.
    fn rcv_create(
        &self,
        owner: ComponentId,
        parent: Cap<RcvObj>,
        entry: EntryIndex,
        flags: RcvFlags,
    ) -> Result<KernelRcv, KernelError>;

    /// Installs thread, rcv and tcap capabilities for `rcv` in `into`
    fn rcv_alias(&self, rcv: &KernelRcv, into: ComponentId) -> Result<RcvAliases, KernelError>;

    /// Removes the capabilities `rcv_alias` installed in `from`
    fn rcv_alias_revoke(&self, aliases: &RcvAliases, from: ComponentId)
        -> Result<(), KernelError>;

    /// Destroys a receive endpoint together with its thread and tcap
    ///
    /// Aliases must be revoked first; the endpoint's capabilities in
    /// capmgr's own table go with it.
    fn rcv_revoke(&self, rcv: &KernelRcv) -> Result<(), KernelError>;

    /// Creates a send endpoint targeting `rcv`
    fn asnd_create(&self, rcv: &KernelRcv) -> Result<KernelAsnd, KernelError>;

    /// Installs a capability to `asnd` in `into`
    fn asnd_alias(&self, asnd: &KernelAsnd, into: ComponentId)
        -> Result<Cap<AsndObj>, KernelError>;

    /// Destroys an unaliased send endpoint
    fn asnd_revoke(&self, asnd: &KernelAsnd) -> Result<(), KernelError>;

    /// Creates the scheduling execution context of a scheduler component on `core`
    fn sched_execution_create(
        &self,
        component: ComponentId,
        core: CoreId,
    ) -> Result<KernelRcv, KernelError>;

    /// Creates the initial thread of a plain component on `core`
    fn init_thread_create(
        &self,
        component: ComponentId,
        core: CoreId,
    ) -> Result<KernelThread, KernelError>;

    /// Reserves `count` physically contiguous frames in one step
    ///
    /// Returns the physical address of the first frame. Concurrent callers
    /// never receive interleaved frames.
    fn frames_reserve(&self, count: usize) -> Result<Paddr, KernelError>;

    /// Maps `count` frames starting at `first` into `into`
    ///
    /// The first frame is placed at a virtual address aligned to `align`;
    /// the rest follow it contiguously. Returns the first virtual address.
    fn frames_alias(
        &self,
        first: Paddr,
        count: usize,
        align: u64,
        into: ComponentId,
    ) -> Result<Vaddr, KernelError>;

    /// Translates a virtual address in `component` through its page table
    fn translate(&self, component: ComponentId, vaddr: Vaddr) -> Option<Paddr>;

    /// Maps a device/physical range into `component`
    fn hw_map(&self, component: ComponentId, paddr: Paddr, size: u64)
        -> Result<Vaddr, KernelError>;

    /// Creates the user-level-kernel shared region
    fn ulk_init(&self) -> Result<(), KernelError>;

    /// Maps the user-level-kernel region into `component`'s page table
    fn ulk_map_in(&self, component: ComponentId) -> Result<(), KernelError>;
}
