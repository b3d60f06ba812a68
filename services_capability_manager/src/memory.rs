//! Memory Manager
//!
//! Pages, spans and the contiguous physical region.
//!
//! A page is one physical frame plus up to [`MM_MAPPINGS_MAX`] mapping
//! slots, each naming a component and the address the frame appears at
//! there. A span is a run of pages, consecutive in both the page pool and
//! physical memory, that other components can map by id.
//!
//! ## Concurrency
//!
//! - Multi-page allocations reserve their pool indices with
//!   [`HandlePool::allocate_run`] and their frames with one
//!   `frames_reserve` call, so concurrent allocations never interleave.
//!   Contiguity is still verified through the page table afterwards; a
//!   violation is a [`FatalDefect`].
//! - Each page's mapping slots sit behind their own lock. Span mapping
//!   takes the locks of all member pages in index order and checks every
//!   page has a free slot before mapping anything.
//! - The contiguous region is a bump pointer advanced by compare-and-swap.
//!   It never shrinks.

use crate::audit::{AuditTrail, CapMgrEvent};
use crate::config::MM_MAPPINGS_MAX;
use crate::error::{CapMgrError, FatalDefect};
use crate::pool::{Handle, HandlePool, Reservation};
use crate::CapMgrConfig;
use core_types::{ComponentId, Paddr, Vaddr, PAGE_SIZE};
use kernel_api::{KernelApi, KernelError};
use log::{debug, info};
use spin::{Mutex, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One occupied mapping slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub component: ComponentId,
    pub vaddr: Vaddr,
}

/// A physical page and where it is mapped
#[derive(Debug)]
pub struct MmPage {
    frame: Paddr,
    mappings: Mutex<[Option<Mapping>; MM_MAPPINGS_MAX]>,
}

impl MmPage {
    fn new(frame: Paddr, first: Option<Mapping>) -> Self {
        let mut slots = [None; MM_MAPPINGS_MAX];
        slots[0] = first;
        Self {
            frame,
            mappings: Mutex::new(slots),
        }
    }

    pub fn frame(&self) -> Paddr {
        self.frame
    }

    /// Occupied mapping slots
    pub fn mappings(&self) -> Vec<Mapping> {
        self.mappings.lock().iter().flatten().copied().collect()
    }
}

pub type PageHandle = Handle<Arc<MmPage>>;

/// A run of pages, addressed by span id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmSpan {
    /// Pool index of the first page
    pub page_off: u32,
    pub n_pages: u32,
}

#[derive(Debug)]
struct ContigRegion {
    base: Paddr,
    capacity: usize,
    used: AtomicUsize,
}

/// Owner of every page and span record
pub struct MemoryManager {
    pages: HandlePool<Arc<MmPage>>,
    spans: HandlePool<MmSpan>,
    contig: Once<ContigRegion>,
    audit: Arc<AuditTrail>,
}

fn reserve_frames<K: KernelApi + ?Sized>(kernel: &K, count: usize) -> Result<Paddr, CapMgrError> {
    kernel.frames_reserve(count).map_err(|err| match err {
        KernelError::OutOfMemory => CapMgrError::OutOfMemory,
        other => CapMgrError::Kernel(other),
    })
}

fn alias_frames<K: KernelApi + ?Sized>(
    kernel: &K,
    first: Paddr,
    count: usize,
    align: u64,
    into: ComponentId,
) -> Result<Vaddr, FatalDefect> {
    kernel
        .frames_alias(first, count, align, into)
        .map_err(FatalDefect::Kernel)
}

/// Checks that `count` pages at `vaddr` in `component` translate to the
/// frames starting at `first`
pub fn verify_contiguous<K: KernelApi + ?Sized>(
    kernel: &K,
    component: ComponentId,
    vaddr: Vaddr,
    first: Paddr,
    count: usize,
) -> Result<(), FatalDefect> {
    for i in 0..count as u64 {
        let page = vaddr.add_pages(i);
        let expected = first.add_pages(i);
        let found = kernel.translate(component, page);
        if found != Some(expected) {
            return Err(FatalDefect::ContiguityViolation {
                component,
                vaddr: page,
                expected,
                found,
            });
        }
    }
    Ok(())
}

impl MemoryManager {
    pub fn new(config: &CapMgrConfig, audit: Arc<AuditTrail>) -> Self {
        Self {
            pages: HandlePool::new("page", config.max_pages),
            spans: HandlePool::new("span", config.max_spans),
            contig: Once::new(),
            audit,
        }
    }

    /// Publishes a reserved run of pages backed by frames from `first`
    fn publish_run(
        &self,
        run: Vec<Reservation<'_, Arc<MmPage>>>,
        first: Paddr,
        mapped: Option<(ComponentId, Vaddr)>,
    ) -> Option<PageHandle> {
        let count = run.len();
        let mut head = None;
        for (i, pending) in run.into_iter().enumerate() {
            let mapping = mapped.map(|(component, vaddr)| Mapping {
                component,
                vaddr: vaddr.add_pages(i as u64),
            });
            let handle = pending.activate(Arc::new(MmPage::new(
                first.add_pages(i as u64),
                mapping,
            )));
            head.get_or_insert(handle);
        }
        if let Some(head) = head {
            self.audit.record(CapMgrEvent::PagesAllocated {
                component: mapped.map(|(c, _)| c),
                first_page: head.index(),
                count,
            });
        }
        head
    }

    /// Allocates one page, mapped into `component` if given
    pub fn allocate_page<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: Option<ComponentId>,
        align: u64,
    ) -> Result<PageHandle, CapMgrError> {
        self.allocate_pages(kernel, component, 1, align)
            .map(|(head, _)| head)
    }

    /// Allocates `count` physically contiguous pages
    ///
    /// With a component, the pages are mapped there contiguously, the first
    /// at an `align`-aligned address. Returns the head page and the first
    /// address (null when unmapped).
    pub fn allocate_pages<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: Option<ComponentId>,
        count: usize,
        align: u64,
    ) -> Result<(PageHandle, Vaddr), CapMgrError> {
        if count == 0 {
            return Err(CapMgrError::InvalidArgument("zero pages requested"));
        }
        let run = self.pages.allocate_run(count)?;
        let first = reserve_frames(kernel, count)?;

        let mapped = match component {
            Some(c) => {
                let vaddr = alias_frames(kernel, first, count, align, c)?;
                verify_contiguous(kernel, c, vaddr, first, count)?;
                Some((c, vaddr))
            }
            None => None,
        };
        let head = self
            .publish_run(run, first, mapped)
            .ok_or(CapMgrError::InvalidArgument("zero pages requested"))?;
        Ok((head, mapped.map_or(Vaddr(0), |(_, v)| v)))
    }

    /// Maps an existing page into one more component
    ///
    /// Fails with [`CapMgrError::MappingsExhausted`] once all
    /// [`MM_MAPPINGS_MAX`] slots are taken.
    pub fn alias_page<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        page: PageHandle,
        component: ComponentId,
        align: u64,
    ) -> Result<Vaddr, CapMgrError> {
        let record = self
            .pages
            .get(page)
            .ok_or(CapMgrError::InvalidArgument("unknown page"))?;
        let mut slots = record.mappings.lock();
        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or(CapMgrError::MappingsExhausted { page: page.index() })?;

        let vaddr = alias_frames(kernel, record.frame, 1, align, component)?;
        slots[slot] = Some(Mapping { component, vaddr });
        self.audit.record(CapMgrEvent::PageAliased {
            page: page.index(),
            into: component,
            vaddr,
        });
        Ok(vaddr)
    }

    /// Registers `count` pages starting at `head` as a span
    pub fn create_span(&self, head: PageHandle, count: usize) -> Result<u32, CapMgrError> {
        let pending = self.spans.allocate()?;
        self.activate_span(pending, head, count)
    }

    fn activate_span(
        &self,
        pending: Reservation<'_, MmSpan>,
        head: PageHandle,
        count: usize,
    ) -> Result<u32, CapMgrError> {
        let n_pages = u32::try_from(count)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(CapMgrError::InvalidArgument("bad span length"))?;
        let span = pending.activate(MmSpan {
            page_off: head.index(),
            n_pages,
        });
        self.audit.record(CapMgrEvent::SpanCreated {
            span: span.index(),
            pages: count,
        });
        Ok(span.index())
    }

    /// Looks up a span by id
    pub fn span(&self, id: u32) -> Result<MmSpan, CapMgrError> {
        self.spans
            .handle_at(id)
            .and_then(|h| self.spans.get(h))
            .ok_or(CapMgrError::UnknownSpan(id))
    }

    /// Maps every page of span `id` into `component`
    ///
    /// The first page lands at an `align`-aligned address and the rest
    /// follow it page by page. Nothing is mapped unless every page has a
    /// free slot. Returns the page count and the first address.
    pub fn map_span<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        id: u32,
        component: ComponentId,
        align: u64,
    ) -> Result<(usize, Vaddr), CapMgrError> {
        let span = self.span(id)?;
        let pages = (span.page_off..span.page_off + span.n_pages)
            .map(|i| self.pages.handle_at(i).and_then(|h| self.pages.get(h)))
            .collect::<Option<Vec<_>>>()
            .ok_or(CapMgrError::UnknownSpan(id))?;

        let mut guards: Vec<_> = pages.iter().map(|p| p.mappings.lock()).collect();
        let mut free = Vec::with_capacity(guards.len());
        for (i, slots) in guards.iter().enumerate() {
            let slot = slots
                .iter()
                .position(Option::is_none)
                .ok_or(CapMgrError::MappingsExhausted {
                    page: span.page_off + i as u32,
                })?;
            free.push(slot);
        }

        let first = pages[0].frame;
        for (i, page) in pages.iter().enumerate() {
            if page.frame != first.add_pages(i as u64) {
                return Err(FatalDefect::SpanNotContiguous {
                    span: id,
                    page: span.page_off + i as u32,
                }
                .into());
            }
        }

        let count = pages.len();
        let vaddr = alias_frames(kernel, first, count, align, component)?;
        verify_contiguous(kernel, component, vaddr, first, count)?;
        for (i, (slots, slot)) in guards.iter_mut().zip(free).enumerate() {
            slots[slot] = Some(Mapping {
                component,
                vaddr: vaddr.add_pages(i as u64),
            });
        }
        drop(guards);

        self.audit.record(CapMgrEvent::SpanMapped {
            span: id,
            into: component,
            vaddr,
        });
        Ok((count, vaddr))
    }

    /// Allocates `count` pages mapped into `component` and registers them as a span
    pub fn allocate_shared<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        count: usize,
        align: u64,
    ) -> Result<(u32, Vaddr), CapMgrError> {
        let pending = self.spans.allocate()?;
        let (head, vaddr) = self.allocate_pages(kernel, Some(component), count, align)?;
        let span = self.activate_span(pending, head, count)?;
        Ok((span, vaddr))
    }

    /// Allocates `count` unmapped pages as span `id`
    ///
    /// Fails if the pool cannot hand out that exact id.
    pub fn allocate_shared_at_id<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        id: u32,
        count: usize,
        align: u64,
    ) -> Result<u32, CapMgrError> {
        let pending = self.spans.allocate_at(id)?;
        let (head, _) = self.allocate_pages(kernel, None, count, align)?;
        let assigned = self.activate_span(pending, head, count)?;
        if assigned != id {
            if let Some(handle) = self.spans.handle_at(assigned) {
                let _ = self.spans.free(handle);
            }
            return Err(CapMgrError::SpanIdMismatch {
                requested: id,
                assigned,
            });
        }
        Ok(assigned)
    }

    /// Reserves the contiguous region and maps it into capmgr itself
    pub fn init_contig<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        self_id: ComponentId,
        pages: usize,
    ) -> Result<(), FatalDefect> {
        let base = if pages == 0 {
            Paddr(0)
        } else {
            let base = kernel.frames_reserve(pages).map_err(FatalDefect::Kernel)?;
            let vaddr = alias_frames(kernel, base, pages, PAGE_SIZE, self_id)?;
            verify_contiguous(kernel, self_id, vaddr, base, pages)?;
            base
        };
        self.contig.call_once(|| ContigRegion {
            base,
            capacity: pages,
            used: AtomicUsize::new(0),
        });
        info!("capmgr: reserved {} contiguous pages at {}", pages, base);
        Ok(())
    }

    /// Advances the bump pointer by `count` pages, returning the old offset
    fn bump(&self, count: usize) -> Result<(Paddr, usize), CapMgrError> {
        let region = self.contig.get().ok_or(CapMgrError::ContigExhausted {
            requested: count,
            remaining: 0,
        })?;
        let offset = region
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(count)
                    .filter(|end| *end <= region.capacity)
            })
            .map_err(|used| CapMgrError::ContigExhausted {
                requested: count,
                remaining: region.capacity - used,
            })?;
        Ok((region.base.add_pages(offset as u64), offset))
    }

    fn carve_contig<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        count: usize,
        align: u64,
    ) -> Result<(PageHandle, Vaddr), CapMgrError> {
        if count == 0 {
            return Err(CapMgrError::InvalidArgument("zero pages requested"));
        }
        let run = self.pages.allocate_run(count)?;
        let (first, offset) = self.bump(count)?;
        let vaddr = alias_frames(kernel, first, count, align, component)?;
        verify_contiguous(kernel, component, vaddr, first, count)?;
        let head = self
            .publish_run(run, first, Some((component, vaddr)))
            .ok_or(CapMgrError::InvalidArgument("zero pages requested"))?;
        self.audit.record(CapMgrEvent::ContigAllocated {
            component,
            offset,
            count,
        });
        debug!(
            "capmgr: {} contiguous pages at offset {} for {}",
            count, offset, component
        );
        Ok((head, vaddr))
    }

    /// Carves `count` pages off the contiguous region into `component`
    pub fn allocate_contiguous<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        count: usize,
    ) -> Result<Vaddr, CapMgrError> {
        self.carve_contig(kernel, component, count, PAGE_SIZE)
            .map(|(_, vaddr)| vaddr)
    }

    /// Like [`MemoryManager::allocate_contiguous`], also registering a span
    pub fn allocate_contiguous_shared<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        count: usize,
        align: u64,
    ) -> Result<(u32, Vaddr), CapMgrError> {
        let pending = self.spans.allocate()?;
        let (head, vaddr) = self.carve_contig(kernel, component, count, align)?;
        let span = self.activate_span(pending, head, count)?;
        Ok((span, vaddr))
    }

    /// Physical address behind `vaddr` in `component`
    pub fn translate<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        vaddr: Vaddr,
    ) -> Result<Paddr, CapMgrError> {
        kernel
            .translate(component, vaddr)
            .ok_or(CapMgrError::NotMapped { component, vaddr })
    }

    /// Maps device memory into `component`
    pub fn map_physical<K: KernelApi + ?Sized>(
        &self,
        kernel: &K,
        component: ComponentId,
        paddr: Paddr,
        size: u64,
    ) -> Result<Vaddr, CapMgrError> {
        if size == 0 {
            return Err(CapMgrError::InvalidArgument("empty physical region"));
        }
        kernel
            .hw_map(component, paddr, size)
            .map_err(CapMgrError::Kernel)
    }

    pub fn page(&self, handle: PageHandle) -> Option<Arc<MmPage>> {
        self.pages.get(handle)
    }

    /// Page record at a pool index
    pub fn page_at(&self, index: u32) -> Option<Arc<MmPage>> {
        self.pages.handle_at(index).and_then(|h| self.pages.get(h))
    }

    pub fn page_count(&self) -> usize {
        self.pages.active_count()
    }

    pub fn span_count(&self) -> usize {
        self.spans.active_count()
    }

    /// Pages handed out from the contiguous region so far
    pub fn contig_used(&self) -> usize {
        self.contig
            .get()
            .map_or(0, |r| r.used.load(Ordering::Acquire))
    }

    pub fn contig_capacity(&self) -> usize {
        self.contig.get().map_or(0, |r| r.capacity)
    }
}
