//! Resilience Test Utilities
//!
//! This crate provides shared utilities for end-to-end capmgr tests.
//!
//! ## Test Philosophy
//!
//! - **Whole system**: every scenario boots capmgr from a manifest, against
//!   the simulated kernel and scheduler
//! - **Deterministic failures**: kernel faults are reproducible via `FaultPlan`
//! - **Pressure is not a crash**: exhaustion must surface as a null reply,
//!   never as a halted service

use core_types::{ComponentId, CoreId};
use manifest::SystemManifest;
use serde_json::{json, Value};
use services_capability_manager::{CapMgrConfig, CapabilityManager, FatalDefect, InvocationContext};
use sim_kernel::{SimulatedKernel, SimulatedScheduler};

/// Component id capmgr runs as in every scenario
pub const CAPMGR: ComponentId = ComponentId(2);

/// capmgr over the simulated collaborators
pub type TestCapMgr = CapabilityManager<SimulatedKernel, SimulatedScheduler>;

/// Builds the JSON manifest for a test system
///
/// Every added component gets a comp/captbl/pgtbl triple and a name.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    captbl_end: u64,
    next_capid: u64,
    captbl: Vec<Value>,
    names: serde_json::Map<String, Value>,
    execute: Vec<Value>,
    scheduler_hierarchy: serde_json::Map<String, Value>,
    init_hierarchy: serde_json::Map<String, Value>,
    addrspc_shared: Vec<u64>,
    shmem: Vec<Value>,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            captbl_end: 64,
            next_capid: 20,
            captbl: Vec::new(),
            names: serde_json::Map::new(),
            execute: Vec::new(),
            scheduler_hierarchy: serde_json::Map::new(),
            init_hierarchy: serde_json::Map::new(),
            addrspc_shared: Vec::new(),
            shmem: Vec::new(),
        }
    }

    /// Adds an already-booted component
    pub fn component(mut self, id: u64, name: &str) -> Self {
        for cap_type in ["comp", "captbl", "pgtbl"] {
            self.captbl.push(json!({
                "capid": self.next_capid,
                "type": cap_type,
                "target": id,
            }));
            self.next_capid += 1;
        }
        self.names.insert(id.to_string(), json!(name));
        self
    }

    /// Appends to the execution plan (`"sched"` or `"init"`)
    pub fn execute(mut self, id: u64, kind: &str) -> Self {
        self.execute.push(json!([id, kind]));
        self
    }

    pub fn scheduled_by(mut self, client: u64, sched: u64) -> Self {
        self.scheduler_hierarchy
            .insert(client.to_string(), json!(sched));
        self
    }

    pub fn directly_scheduled_by(mut self, client: u64, sched: u64) -> Self {
        self.init_hierarchy.insert(client.to_string(), json!(sched));
        self
    }

    pub fn shared_address_space(mut self, id: u64) -> Self {
        self.addrspc_shared.push(id);
        self
    }

    pub fn shmem(mut self, id: u32, size: usize) -> Self {
        self.shmem.push(json!({ "id": id, "size": size }));
        self
    }

    pub fn captbl_end(mut self, end: u64) -> Self {
        self.captbl_end = end;
        self
    }

    /// Adds a raw captbl entry, for malformed-manifest scenarios
    pub fn raw_cap(mut self, capid: u64, cap_type: &str, target: u64) -> Self {
        self.captbl.push(json!({
            "capid": capid,
            "type": cap_type,
            "target": target,
        }));
        self
    }

    pub fn to_json(&self) -> Value {
        json!({
            "captbl_end": self.captbl_end,
            "execute": self.execute,
            "captbl": self.captbl,
            "names": self.names,
            "scheduler_hierarchy": self.scheduler_hierarchy,
            "init_hierarchy": self.init_hierarchy,
            "addrspc_shared": self.addrspc_shared,
            "virt_resources": { "shmem": self.shmem },
        })
    }

    pub fn build(&self) -> SystemManifest {
        SystemManifest::from_json(&self.to_json().to_string())
            .unwrap_or_else(|err| panic!("test manifest does not parse: {}", err))
    }
}

/// The two-component system most scenarios use: client 5 scheduled by 6
pub fn client_and_scheduler() -> ManifestBuilder {
    ManifestBuilder::new()
        .component(5, "client")
        .component(6, "sched")
        .component(7, "bystander")
        .execute(6, "sched")
        .execute(5, "init")
        .scheduled_by(5, 6)
}

/// Boots capmgr from `manifest` against a fresh simulated kernel
pub fn try_bootstrap(manifest: &ManifestBuilder) -> Result<TestCapMgr, FatalDefect> {
    bootstrap_with(manifest, CapMgrConfig::for_tests(), SimulatedKernel::new(CAPMGR))
}

/// Boots capmgr with an explicit config and kernel
pub fn bootstrap_with(
    manifest: &ManifestBuilder,
    config: CapMgrConfig,
    kernel: SimulatedKernel,
) -> Result<TestCapMgr, FatalDefect> {
    CapabilityManager::boot(config, manifest.build(), kernel, SimulatedScheduler::new())
}

/// Bootstrap helper for tests
///
/// Boots capmgr and runs per-core execution setup on core 0.
pub fn test_bootstrap(manifest: &ManifestBuilder) -> TestCapMgr {
    let cm = try_bootstrap(manifest).unwrap_or_else(|err| panic!("boot failed: {}", err));
    cm.parallel_init(CoreId(0), true)
        .unwrap_or_else(|err| panic!("parallel init failed: {}", err));
    cm
}

/// Invocation context for `caller` on core 0
pub fn as_component(caller: u64) -> InvocationContext {
    InvocationContext::new(ComponentId(caller), CoreId(0))
}
