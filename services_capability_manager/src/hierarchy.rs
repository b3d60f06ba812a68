//! Scheduler ownership table
//!
//! Built once at boot from the manifest and read-only afterwards. The
//! direct assignment (`init_hierarchy`) wins; the hierarchical one
//! (`scheduler_hierarchy`) is the fallback. Id 0 means "no scheduler" in
//! both sections.

use core_types::ComponentId;
use manifest::SystemManifest;
use std::collections::BTreeMap;

/// Component → scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerHierarchy {
    owners: BTreeMap<ComponentId, ComponentId>,
}

impl SchedulerHierarchy {
    pub fn from_manifest(manifest: &SystemManifest) -> Self {
        let ids = manifest
            .init_hierarchy
            .keys()
            .chain(manifest.scheduler_hierarchy.keys())
            .map(|id| ComponentId(*id));

        let mut owners = BTreeMap::new();
        for id in ids {
            let direct = manifest.direct_scheduler(id);
            let sched = if direct.is_some() {
                direct
            } else {
                manifest.hierarchical_scheduler(id)
            };
            if sched.is_some() {
                owners.insert(id, sched);
            }
        }
        Self { owners }
    }

    /// The scheduler responsible for `id`
    pub fn scheduler_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.owners.get(&id).copied()
    }

    pub fn is_scheduler_of(&self, sched: ComponentId, client: ComponentId) -> bool {
        self.scheduler_of(client) == Some(sched)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
