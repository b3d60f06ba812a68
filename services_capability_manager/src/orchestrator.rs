//! Manifest-driven orchestration
//!
//! Boot reads the manifest once and reconstructs everything capmgr needs:
//! component records for the already-booted components, the scheduler
//! table, the user-level-kernel region, the boot-time shared-memory spans
//! and the contiguous physical region. After boot, every core runs
//! [`CapabilityManager::parallel_init`] and then
//! [`CapabilityManager::parallel_main`].
//!
//! Any failure on these paths is a [`FatalDefect`]: the image was composed
//! inconsistently and there is nobody to report to.

use crate::audit::{AuditTrail, CapMgrAuditLog};
use crate::error::FatalDefect;
use crate::hierarchy::SchedulerHierarchy;
use crate::init_protocol::InitRegistry;
use crate::memory::MemoryManager;
use crate::objects::{ComponentKind, Objects};
use crate::CapMgrConfig;
use core_types::{Cap, ComponentId, CoreId, Vaddr, PAGE_SIZE};
use kernel_api::{ComponentResources, KernelApi, KernelError, SchedulerApi};
use log::{debug, info};
use manifest::{ExecutionKind, SystemManifest};
use std::sync::Arc;

/// Name of capmgr's own component record
pub const CAPMGR_NAME: &str = "capmgr";

/// The capability manager
///
/// Owns the kernel and scheduler handles it drives. All request paths take
/// `&self`; share it across cores behind an `Arc`.
pub struct CapabilityManager<K: KernelApi, S: SchedulerApi> {
    pub(crate) config: CapMgrConfig,
    pub(crate) kernel: K,
    pub(crate) sched: S,
    pub(crate) manifest: SystemManifest,
    pub(crate) plan: Vec<(ComponentId, ExecutionKind)>,
    pub(crate) hierarchy: SchedulerHierarchy,
    pub(crate) objects: Objects,
    pub(crate) memory: MemoryManager,
    pub(crate) init: InitRegistry,
    pub(crate) audit: Arc<AuditTrail>,
}

impl<K: KernelApi, S: SchedulerApi> CapabilityManager<K, S> {
    /// Brings capmgr up from the manifest
    pub fn boot(
        config: CapMgrConfig,
        manifest: SystemManifest,
        kernel: K,
        sched: S,
    ) -> Result<Self, FatalDefect> {
        info!("capmgr: starting the capability manager");
        if manifest.captbl_end < config.captbl_free {
            return Err(FatalDefect::CaptblEndTooLow {
                captbl_end: manifest.captbl_end,
                captbl_free: config.captbl_free,
            });
        }
        let plan = manifest.execution_plan()?;
        let groups = manifest.component_caps()?;

        let audit = Arc::new(AuditTrail::new());
        let objects = Objects::new(&config, Arc::clone(&audit));
        let memory = MemoryManager::new(&config, Arc::clone(&audit));

        let self_id = config.self_id;
        objects.register_component(self_id, CAPMGR_NAME, ComponentKind::Capmgr, None, || {
            kernel.component_create(self_id, CAPMGR_NAME, None)
        })?;

        let hierarchy = SchedulerHierarchy::from_manifest(&manifest);

        info!(
            "capmgr: processing {} capabilities for components that have already been booted",
            manifest.captbl.len()
        );
        for group in groups {
            let id = group.component;
            let name = manifest.name(id).ok_or(FatalDefect::MissingName(id))?;
            let frontiers = manifest.frontiers(id);
            let resources = ComponentResources {
                comp: Cap::new(group.comp),
                captbl: Cap::new(group.captbl),
                pgtbl: Cap::new(group.pgtbl),
                heap_frontier: Vaddr(frontiers.heap),
                captbl_frontier: frontiers.captbl,
            };
            objects.register_component(id, name, ComponentKind::Booted, Some(resources), || {
                kernel.component_create(id, name, Some(&resources))
            })?;
            info!("capmgr: created component {}: {}", name, id);
            debug!(
                "capmgr: {} captbl {} pgtbl {} comp {} frontiers {} / {:#x}, sched {:?}",
                id,
                group.captbl,
                group.pgtbl,
                group.comp,
                frontiers.captbl,
                frontiers.heap,
                hierarchy.scheduler_of(id)
            );
        }

        kernel.ulk_init().map_err(FatalDefect::Kernel)?;
        for id in manifest.shared_address_space() {
            if !objects.has_component(id) {
                return Err(FatalDefect::ComponentMissing(id));
            }
            match kernel.ulk_map_in(id) {
                // Components sharing a page table see the region already
                Ok(()) | Err(KernelError::AlreadyMapped(_)) => {}
                Err(err) => return Err(FatalDefect::Kernel(err)),
            }
        }

        for region in manifest.shmem_regions() {
            memory.allocate_shared_at_id(&kernel, region.id, region.size, PAGE_SIZE)?;
            debug!(
                "capmgr: shared region {} with {} pages",
                region.id, region.size
            );
        }

        memory.init_contig(&kernel, self_id, config.contig_pages)?;

        let init = InitRegistry::new(
            plan.iter().map(|(id, _)| *id),
            config.num_cores,
            Arc::clone(&audit),
        );

        Ok(Self {
            config,
            kernel,
            sched,
            manifest,
            plan,
            hierarchy,
            objects,
            memory,
            init,
            audit,
        })
    }

    /// Creates the execution every component in the plan needs on `core`
    pub fn parallel_init(&self, core: CoreId, is_init_core: bool) -> Result<(), FatalDefect> {
        if is_init_core {
            info!(
                "capmgr: {} components that need execution",
                self.plan.len()
            );
        }
        for (id, kind) in &self.plan {
            let id = *id;
            if id == self.config.self_id {
                return Err(FatalDefect::SelfExecution(id));
            }
            if !self.objects.has_component(id) {
                return Err(FatalDefect::ComponentMissing(id));
            }
            match kind {
                ExecutionKind::Sched => {
                    self.objects
                        .create_sched_execution(&self.kernel, id, core)?;
                    if is_init_core {
                        info!("capmgr: created scheduling execution for {}", id);
                    }
                }
                ExecutionKind::Init => {
                    self.objects.create_init_thread(&self.kernel, id, core)?;
                    if is_init_core {
                        info!("capmgr: created thread for {}", id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Starts initialization of every planned component, in manifest order
    pub fn parallel_main(&self, core: CoreId) -> Result<(), FatalDefect> {
        for (id, _) in &self.plan {
            self.init.begin(&self.sched, *id, core)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &CapMgrConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn scheduler(&self) -> &S {
        &self.sched
    }

    pub fn manifest(&self) -> &SystemManifest {
        &self.manifest
    }

    pub fn hierarchy(&self) -> &SchedulerHierarchy {
        &self.hierarchy
    }

    pub fn objects(&self) -> &Objects {
        &self.objects
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn init_registry(&self) -> &InitRegistry {
        &self.init
    }

    /// Copy of the audit log as it stands
    pub fn audit_log(&self) -> CapMgrAuditLog {
        self.audit.snapshot()
    }
}
