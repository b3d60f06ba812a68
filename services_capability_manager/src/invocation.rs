//! Invocation surface
//!
//! Every request carries the invoking component in its
//! [`InvocationContext`]. Apart from thread creation, whose target is
//! checked against the scheduler table, a request always acts on behalf of
//! its caller; there is no argument naming another component to act for.
//!
//! The typed methods return `Result`. [`CapabilityManager::dispatch`] is the
//! wire-facing form: recoverable errors become the null replies clients
//! expect, and only fatal defects come back as `Err`.

use crate::audit::CapMgrEvent;
use crate::error::{CapMgrError, FatalDefect, ServiceHalt};
use crate::init_protocol::{InitMain, InitOutcome};
use crate::orchestrator::CapabilityManager;
use crate::objects::{CmThread, ThreadAlias};
use core_types::{
    AsndObj, Cap, ComponentId, CoreId, EntryIndex, Paddr, RcvObj, ThreadId, ThreadObj, Vaddr,
    PAGE_SIZE,
};
use kernel_api::{KernelApi, RcvFlags, SchedulerApi};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

/// Who is invoking, and from which core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub caller: ComponentId,
    pub core: CoreId,
}

impl InvocationContext {
    pub fn new(caller: ComponentId, core: CoreId) -> Self {
        Self { caller, core }
    }
}

/// A receive endpoint as seen by the scheduler that asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveEndpoint {
    pub rcv: Cap<RcvObj>,
    pub asnd: Cap<AsndObj>,
    pub thread: Cap<ThreadObj>,
    pub tid: ThreadId,
}

/// Requests a component can make of capmgr
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapMgrRequest {
    CreateThread { client: ComponentId, entry: EntryIndex },
    CreateThreadThunk { entry: EntryIndex },
    CreateInitThread { client: ComponentId },
    CreateVcpu { vm: ComponentId, entry: EntryIndex },
    CreateReceiveEndpoint { entry: EntryIndex, flags: RcvFlags },
    CreateVmComponent,
    TranslateVirtualToPhysical { vaddr: Vaddr },
    AllocateHeapPages { count: usize, align: Option<u64> },
    MapPhysicalRegion { paddr: Paddr, size: u64 },
    AllocateSharedPages { count: usize, align: Option<u64> },
    MapSharedSpan { span: u32, align: Option<u64> },
    MapSharedSpanInVm { vm: ComponentId, span: u32, align: Option<u64> },
    AllocateContiguousPages { count: usize },
    AllocateContiguousShared { count: usize, align: Option<u64> },
    SignalInitDone { parallel_requested: bool, main: InitMain },
    SignalInitExit { retval: i32 },
}

/// Replies; the null forms stand for a refused request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapMgrResponse {
    Thread { cap: Cap<ThreadObj>, tid: ThreadId },
    ReceiveEndpoint(ReceiveEndpoint),
    Component(ComponentId),
    Address(Vaddr),
    Physical(Paddr),
    Span { span: u32, vaddr: Vaddr },
    Mapped { pages: usize, vaddr: Vaddr },
    InitDone(InitOutcome),
    Exited,
    /// A lifecycle signal capmgr could not apply
    Refused,
}

impl CapMgrResponse {
    /// The null reply for `request`
    pub fn null_for(request: &CapMgrRequest) -> Self {
        match request {
            CapMgrRequest::CreateThread { .. }
            | CapMgrRequest::CreateThreadThunk { .. }
            | CapMgrRequest::CreateInitThread { .. }
            | CapMgrRequest::CreateVcpu { .. } => CapMgrResponse::Thread {
                cap: Cap::null(),
                tid: ThreadId(0),
            },
            CapMgrRequest::CreateReceiveEndpoint { .. } => {
                CapMgrResponse::ReceiveEndpoint(ReceiveEndpoint {
                    rcv: Cap::null(),
                    asnd: Cap::null(),
                    thread: Cap::null(),
                    tid: ThreadId(0),
                })
            }
            CapMgrRequest::CreateVmComponent => CapMgrResponse::Component(ComponentId::NONE),
            CapMgrRequest::TranslateVirtualToPhysical { .. } => CapMgrResponse::Physical(Paddr(0)),
            CapMgrRequest::AllocateHeapPages { .. }
            | CapMgrRequest::MapPhysicalRegion { .. }
            | CapMgrRequest::AllocateContiguousPages { .. } => CapMgrResponse::Address(Vaddr(0)),
            CapMgrRequest::AllocateSharedPages { .. }
            | CapMgrRequest::AllocateContiguousShared { .. } => CapMgrResponse::Span {
                span: 0,
                vaddr: Vaddr(0),
            },
            CapMgrRequest::MapSharedSpan { .. } | CapMgrRequest::MapSharedSpanInVm { .. } => {
                CapMgrResponse::Mapped {
                    pages: 0,
                    vaddr: Vaddr(0),
                }
            }
            CapMgrRequest::SignalInitDone { .. } | CapMgrRequest::SignalInitExit { .. } => {
                CapMgrResponse::Refused
            }
        }
    }

    /// Whether this is a null reply
    pub fn is_null(&self) -> bool {
        match self {
            CapMgrResponse::Thread { cap, .. } => cap.is_null(),
            CapMgrResponse::ReceiveEndpoint(ep) => ep.rcv.is_null(),
            CapMgrResponse::Component(id) => !id.is_some(),
            CapMgrResponse::Address(vaddr) => vaddr.is_null(),
            CapMgrResponse::Physical(paddr) => paddr.0 == 0,
            CapMgrResponse::Span { span, .. } => *span == 0,
            CapMgrResponse::Mapped { pages, .. } => *pages == 0,
            CapMgrResponse::InitDone(_) | CapMgrResponse::Exited => false,
            CapMgrResponse::Refused => true,
        }
    }
}

fn alignment(align: Option<u64>) -> Result<u64, CapMgrError> {
    let align = align.unwrap_or(PAGE_SIZE);
    if align < PAGE_SIZE || !align.is_power_of_two() {
        return Err(CapMgrError::InvalidArgument("alignment"));
    }
    Ok(align)
}

impl<K: KernelApi, S: SchedulerApi> CapabilityManager<K, S> {
    fn deny(&self, caller: ComponentId, target: ComponentId) -> CapMgrError {
        warn!(
            "capmgr: {} asked to create execution in {}: no permission",
            caller, target
        );
        self.audit
            .record(CapMgrEvent::PermissionDenied { caller, target });
        CapMgrError::PermissionDenied { caller, target }
    }

    /// The caller, provided capmgr has a record of it
    fn acting(&self, ctx: &InvocationContext) -> Result<ComponentId, CapMgrError> {
        if self.objects.has_component(ctx.caller) {
            Ok(ctx.caller)
        } else {
            Err(CapMgrError::UnknownComponent(ctx.caller))
        }
    }

    /// Checks `caller` may create threads in `client`
    ///
    /// Allowed for the client's scheduler, and for the manager of a
    /// virtual-machine client.
    pub fn authorize_execution(
        &self,
        caller: ComponentId,
        client: ComponentId,
    ) -> Result<(), CapMgrError> {
        let record = self.objects.component(client)?;
        if self.hierarchy.is_scheduler_of(caller, client) || record.vm_manager() == Some(caller) {
            Ok(())
        } else {
            Err(self.deny(caller, client))
        }
    }

    /// Creates a thread in `client`, aliased into the calling scheduler
    pub fn create_thread(
        &self,
        ctx: &InvocationContext,
        client: ComponentId,
        entry: EntryIndex,
    ) -> Result<(Cap<ThreadObj>, ThreadId), CapMgrError> {
        self.authorize_execution(ctx.caller, client)?;
        let (_, thread) = self
            .objects
            .create_thread(&self.kernel, client, ctx.caller, entry)?;
        Ok(aliased(&thread))
    }

    /// Creates the initial thread of `client`
    pub fn create_init_thread(
        &self,
        ctx: &InvocationContext,
        client: ComponentId,
    ) -> Result<(Cap<ThreadObj>, ThreadId), CapMgrError> {
        self.create_thread(ctx, client, EntryIndex::INITIAL)
    }

    /// Creates a thread in the caller, aliased into the caller
    pub fn create_thread_thunk(
        &self,
        ctx: &InvocationContext,
        entry: EntryIndex,
    ) -> Result<(Cap<ThreadObj>, ThreadId), CapMgrError> {
        let caller = self.acting(ctx)?;
        let (_, thread) = self
            .objects
            .create_thread(&self.kernel, caller, caller, entry)?;
        Ok(aliased(&thread))
    }

    /// Creates a virtual CPU in `vm`; only its manager may ask
    pub fn create_vcpu(
        &self,
        ctx: &InvocationContext,
        vm: ComponentId,
        entry: EntryIndex,
    ) -> Result<(Cap<ThreadObj>, ThreadId), CapMgrError> {
        let record = self.objects.component(vm)?;
        match record.vm_manager() {
            Some(manager) if manager == ctx.caller => {}
            Some(_) => return Err(self.deny(ctx.caller, vm)),
            None => return Err(CapMgrError::InvalidArgument("not a virtual machine")),
        }
        let (_, thread) = self
            .objects
            .create_thread(&self.kernel, vm, ctx.caller, entry)?;
        Ok(aliased(&thread))
    }

    /// Creates a receive endpoint in the calling scheduler plus a send endpoint to it
    ///
    /// The endpoint's thread reports to the caller's scheduling endpoint on
    /// the invoking core.
    pub fn create_receive_endpoint(
        &self,
        ctx: &InvocationContext,
        entry: EntryIndex,
        flags: RcvFlags,
    ) -> Result<ReceiveEndpoint, CapMgrError> {
        let caller = self.acting(ctx)?;
        let created = self
            .objects
            .create_receive_endpoint(&self.kernel, caller, ctx.core, entry, flags)?;
        match self
            .objects
            .create_send_endpoint(&self.kernel, caller, created.rcv)
        {
            Ok((_, asnd)) => Ok(ReceiveEndpoint {
                rcv: created.aliases.rcv,
                asnd,
                thread: created.aliases.thread,
                tid: created.tid,
            }),
            Err(err) => {
                self.objects
                    .revoke_receive_endpoint(&self.kernel, &created)?;
                Err(err)
            }
        }
    }

    /// Creates a virtual-machine component managed by the caller
    pub fn create_vm_component(&self, ctx: &InvocationContext) -> Result<ComponentId, CapMgrError> {
        let caller = self.acting(ctx)?;
        self.objects.create_vm_component(&self.kernel, caller)
    }

    pub fn translate_virtual_to_physical(
        &self,
        ctx: &InvocationContext,
        vaddr: Vaddr,
    ) -> Result<Paddr, CapMgrError> {
        let caller = self.acting(ctx)?;
        self.memory.translate(&self.kernel, caller, vaddr)
    }

    /// Allocates `count` physically contiguous pages into the caller's heap
    pub fn allocate_heap_pages(
        &self,
        ctx: &InvocationContext,
        count: usize,
        align: Option<u64>,
    ) -> Result<Vaddr, CapMgrError> {
        let caller = self.acting(ctx)?;
        let align = alignment(align)?;
        let (_, vaddr) = self
            .memory
            .allocate_pages(&self.kernel, Some(caller), count, align)?;
        Ok(vaddr)
    }

    pub fn map_physical_region(
        &self,
        ctx: &InvocationContext,
        paddr: Paddr,
        size: u64,
    ) -> Result<Vaddr, CapMgrError> {
        let caller = self.acting(ctx)?;
        self.memory.map_physical(&self.kernel, caller, paddr, size)
    }

    /// Allocates pages in the caller and returns the span others map them by
    pub fn allocate_shared_pages(
        &self,
        ctx: &InvocationContext,
        count: usize,
        align: Option<u64>,
    ) -> Result<(u32, Vaddr), CapMgrError> {
        let caller = self.acting(ctx)?;
        let align = alignment(align)?;
        self.memory
            .allocate_shared(&self.kernel, caller, count, align)
    }

    /// Maps span `span` into the caller
    pub fn map_shared_span(
        &self,
        ctx: &InvocationContext,
        span: u32,
        align: Option<u64>,
    ) -> Result<(usize, Vaddr), CapMgrError> {
        let caller = self.acting(ctx)?;
        let align = alignment(align)?;
        self.memory.map_span(&self.kernel, span, caller, align)
    }

    /// Maps span `span` into `vm`; only the VM's manager may ask
    pub fn map_shared_span_in_vm(
        &self,
        ctx: &InvocationContext,
        vm: ComponentId,
        span: u32,
        align: Option<u64>,
    ) -> Result<(usize, Vaddr), CapMgrError> {
        let record = self.objects.component(vm)?;
        if record.vm_manager() != Some(ctx.caller) {
            return Err(self.deny(ctx.caller, vm));
        }
        let align = alignment(align)?;
        self.memory.map_span(&self.kernel, span, vm, align)
    }

    pub fn allocate_contiguous_pages(
        &self,
        ctx: &InvocationContext,
        count: usize,
    ) -> Result<Vaddr, CapMgrError> {
        let caller = self.acting(ctx)?;
        self.memory
            .allocate_contiguous(&self.kernel, caller, count)
    }

    pub fn allocate_contiguous_shared(
        &self,
        ctx: &InvocationContext,
        count: usize,
        align: Option<u64>,
    ) -> Result<(u32, Vaddr), CapMgrError> {
        let caller = self.acting(ctx)?;
        let align = alignment(align)?;
        self.memory
            .allocate_contiguous_shared(&self.kernel, caller, count, align)
    }

    /// The caller finished an initialization step on the invoking core
    pub fn signal_init_done(
        &self,
        ctx: &InvocationContext,
        parallel_requested: bool,
        main: InitMain,
    ) -> Result<InitOutcome, CapMgrError> {
        let caller = self.acting(ctx)?;
        self.init
            .done(&self.sched, caller, ctx.core, parallel_requested, main)
    }

    /// The caller exited
    pub fn signal_init_exit(&self, ctx: &InvocationContext, retval: i32) -> Result<(), CapMgrError> {
        let caller = self.acting(ctx)?;
        self.init.exit(&self.sched, caller, retval)
    }

    /// Slow-path lookup of a thread capmgr created
    pub fn find_thread(&self, tid: ThreadId) -> Option<CmThread> {
        self.objects.find_thread_by_tid(tid).map(|(_, t)| t)
    }

    fn handle(
        &self,
        ctx: &InvocationContext,
        request: &CapMgrRequest,
    ) -> Result<CapMgrResponse, CapMgrError> {
        let thread = |(cap, tid)| CapMgrResponse::Thread { cap, tid };
        let span = |(span, vaddr)| CapMgrResponse::Span { span, vaddr };
        let mapped = |(pages, vaddr)| CapMgrResponse::Mapped { pages, vaddr };

        match *request {
            CapMgrRequest::CreateThread { client, entry } => {
                self.create_thread(ctx, client, entry).map(thread)
            }
            CapMgrRequest::CreateThreadThunk { entry } => {
                self.create_thread_thunk(ctx, entry).map(thread)
            }
            CapMgrRequest::CreateInitThread { client } => {
                self.create_init_thread(ctx, client).map(thread)
            }
            CapMgrRequest::CreateVcpu { vm, entry } => self.create_vcpu(ctx, vm, entry).map(thread),
            CapMgrRequest::CreateReceiveEndpoint { entry, flags } => self
                .create_receive_endpoint(ctx, entry, flags)
                .map(CapMgrResponse::ReceiveEndpoint),
            CapMgrRequest::CreateVmComponent => self
                .create_vm_component(ctx)
                .map(CapMgrResponse::Component),
            CapMgrRequest::TranslateVirtualToPhysical { vaddr } => self
                .translate_virtual_to_physical(ctx, vaddr)
                .map(CapMgrResponse::Physical),
            CapMgrRequest::AllocateHeapPages { count, align } => self
                .allocate_heap_pages(ctx, count, align)
                .map(CapMgrResponse::Address),
            CapMgrRequest::MapPhysicalRegion { paddr, size } => self
                .map_physical_region(ctx, paddr, size)
                .map(CapMgrResponse::Address),
            CapMgrRequest::AllocateSharedPages { count, align } => {
                self.allocate_shared_pages(ctx, count, align).map(span)
            }
            CapMgrRequest::MapSharedSpan { span: id, align } => {
                self.map_shared_span(ctx, id, align).map(mapped)
            }
            CapMgrRequest::MapSharedSpanInVm { vm, span: id, align } => {
                self.map_shared_span_in_vm(ctx, vm, id, align).map(mapped)
            }
            CapMgrRequest::AllocateContiguousPages { count } => self
                .allocate_contiguous_pages(ctx, count)
                .map(CapMgrResponse::Address),
            CapMgrRequest::AllocateContiguousShared { count, align } => {
                self.allocate_contiguous_shared(ctx, count, align).map(span)
            }
            CapMgrRequest::SignalInitDone {
                parallel_requested,
                main,
            } => self
                .signal_init_done(ctx, parallel_requested, main)
                .map(CapMgrResponse::InitDone),
            CapMgrRequest::SignalInitExit { retval } => self
                .signal_init_exit(ctx, retval)
                .map(|()| CapMgrResponse::Exited),
        }
    }

    /// Answers one request
    ///
    /// Recoverable failures become the request's null reply. A fatal
    /// defect is returned and the caller must stop serving.
    pub fn dispatch(
        &self,
        ctx: &InvocationContext,
        request: &CapMgrRequest,
    ) -> Result<CapMgrResponse, FatalDefect> {
        match self.handle(ctx, request) {
            Ok(response) => Ok(response),
            Err(err) => {
                let err = err.into_defect()?;
                debug!("capmgr: {:?} from {} refused: {}", request, ctx.caller, err);
                Ok(CapMgrResponse::null_for(request))
            }
        }
    }

    /// Answers requests in order until they run out or a defect halts the service
    pub fn serve<I>(&self, requests: I) -> Result<Vec<CapMgrResponse>, ServiceHalt>
    where
        I: IntoIterator<Item = (InvocationContext, CapMgrRequest)>,
    {
        let mut responses = Vec::new();
        for (ctx, request) in requests {
            match self.dispatch(&ctx, &request) {
                Ok(response) => responses.push(response),
                Err(defect) => {
                    error!("capmgr: halting on {:?} from {}: {}", request, ctx.caller, defect);
                    return Err(ServiceHalt {
                        served: responses.len(),
                        defect,
                    });
                }
            }
        }
        Ok(responses)
    }
}

fn aliased(thread: &CmThread) -> (Cap<ThreadObj>, ThreadId) {
    match thread.alias {
        ThreadAlias::Aliased(cap) => (cap, thread.tid()),
        _ => (Cap::null(), thread.tid()),
    }
}
