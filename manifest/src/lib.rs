//! # System Manifest
//!
//! The static description of the system produced when the image is composed:
//! which components exist, which capabilities capmgr holds for them, who
//! schedules whom, and what each component runs first.
//!
//! ## Philosophy
//!
//! - **Read once, trust afterwards**: the manifest is validated when capmgr
//!   boots and is read-only from then on.
//! - **Typed queries**: callers ask for an execution kind or a captbl group,
//!   not for raw strings.
//! - **Keyed access kept**: `value("names/5")` style lookups are supported for
//!   the handful of places that address the manifest by path.
//!
//! ## Format
//!
//! The manifest is JSON:
//!
//! ```
//! use manifest::SystemManifest;
//!
//! let manifest = SystemManifest::from_json(r#"{
//!     "captbl_end": 64,
//!     "execute": [[5, "init"]],
//!     "captbl": [
//!         { "capid": 10, "type": "comp",   "target": 5 },
//!         { "capid": 11, "type": "captbl", "target": 5 },
//!         { "capid": 12, "type": "pgtbl",  "target": 5 }
//!     ],
//!     "scheduler_hierarchy": { "5": 6 },
//!     "names": { "5": "client" }
//! }"#).unwrap();
//!
//! assert_eq!(manifest.value("scheduler_hierarchy/5").as_deref(), Some("6"));
//! assert_eq!(manifest.value("names/5").as_deref(), Some("client"));
//! ```

pub mod captbl;

pub use captbl::{CapType, CaptblEntry, ComponentCaps};

use core_types::ComponentId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors found while reading or validating a manifest
///
/// Every one of these means the image was composed inconsistently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Malformed manifest: {0}")]
    Parse(String),

    #[error("Unknown execution kind: {0}")]
    UnknownExecutionKind(String),

    #[error("Unknown capability type {cap_type} for capid {capid}")]
    UnknownCapType { capid: u64, cap_type: String },

    #[error("Capability {capid} targets {found}, expected {expected}")]
    InconsistentCaptbl {
        capid: u64,
        expected: ComponentId,
        found: ComponentId,
    },

    #[error("Incomplete capability group for {0}")]
    IncompleteCaptbl(ComponentId),

    #[error("Invalid capability id 0 in captbl")]
    InvalidCapId,
}

/// What capmgr creates in a component when execution starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    /// A scheduling execution context (the component is a scheduler)
    Sched,
    /// A plain initial thread
    Init,
}

impl FromStr for ExecutionKind {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sched" => Ok(ExecutionKind::Sched),
            "init" => Ok(ExecutionKind::Init),
            other => Err(ManifestError::UnknownExecutionKind(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Sched => write!(f, "sched"),
            ExecutionKind::Init => write!(f, "init"),
        }
    }
}

/// A shared-memory region to carve at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemRegion {
    /// The span id other components will use to map the region
    pub id: u32,
    /// Size in pages
    pub size: usize,
}

/// Virtual resources declared for the whole system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtResources {
    #[serde(default)]
    pub shmem: Vec<ShmemRegion>,
}

/// Address-space and capability-table frontiers of a booted component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontiers {
    #[serde(default)]
    pub heap: u64,
    #[serde(default)]
    pub captbl: u64,
}

/// The system manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemManifest {
    /// First capability slot left free in capmgr's table by the composer
    #[serde(default)]
    pub captbl_end: u64,
    /// Component id → execution kind, in initialization order
    #[serde(default)]
    pub execute: Vec<(u64, String)>,
    /// Capabilities capmgr holds for already-booted components, by capid
    #[serde(default)]
    pub captbl: Vec<CaptblEntry>,
    /// Component id → scheduler id, from the scheduler hierarchy
    #[serde(default)]
    pub scheduler_hierarchy: BTreeMap<u64, u64>,
    /// Component id → scheduler id, from the initialization hierarchy
    #[serde(default)]
    pub init_hierarchy: BTreeMap<u64, u64>,
    /// Component id → human-readable name
    #[serde(default)]
    pub names: BTreeMap<u64, String>,
    /// Components sharing capmgr's privileged address-space region
    #[serde(default)]
    pub addrspc_shared: Vec<u64>,
    #[serde(default)]
    pub virt_resources: VirtResources,
    /// Component id → frontiers; components not listed start at zero
    #[serde(default)]
    pub frontiers: BTreeMap<u64, Frontiers>,
}

impl SystemManifest {
    /// Creates an empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a manifest from JSON
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json).map_err(|err| ManifestError::Parse(err.to_string()))
    }

    /// Serializes the manifest to JSON
    pub fn to_json(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self).map_err(|err| ManifestError::Parse(err.to_string()))
    }

    /// Looks up a single value by its manifest path
    ///
    /// Supported paths: `captbl_end`, `names/<id>`,
    /// `scheduler_hierarchy/<id>`, `init_hierarchy/<id>`.
    pub fn value(&self, key: &str) -> Option<String> {
        if key == "captbl_end" {
            return Some(self.captbl_end.to_string());
        }
        let (section, id) = key.split_once('/')?;
        let id: u64 = id.parse().ok()?;
        match section {
            "names" => self.names.get(&id).cloned(),
            "scheduler_hierarchy" => self.scheduler_hierarchy.get(&id).map(u64::to_string),
            "init_hierarchy" => self.init_hierarchy.get(&id).map(u64::to_string),
            _ => None,
        }
    }

    /// Number of entries under a top-level key, if the key is a list
    pub fn entry_len(&self, key: &str) -> Option<usize> {
        match key {
            "execute" => Some(self.execute.len()),
            "captbl" => Some(self.captbl.len()),
            "addrspc_shared" => Some(self.addrspc_shared.len()),
            "virt_resources/shmem" => Some(self.virt_resources.shmem.len()),
            _ => None,
        }
    }

    /// The execution plan in manifest order, with kinds parsed
    pub fn execution_plan(&self) -> Result<Vec<(ComponentId, ExecutionKind)>, ManifestError> {
        self.execute
            .iter()
            .map(|(id, kind)| Ok((ComponentId(*id), kind.parse()?)))
            .collect()
    }

    /// Groups the captbl entries into one triple per component
    pub fn component_caps(&self) -> Result<Vec<ComponentCaps>, ManifestError> {
        captbl::group(&self.captbl)
    }

    /// Direct scheduler assignment (`init_hierarchy`), `NONE` when absent
    pub fn direct_scheduler(&self, id: ComponentId) -> ComponentId {
        ComponentId(self.init_hierarchy.get(&id.0).copied().unwrap_or(0))
    }

    /// Hierarchical scheduler assignment (`scheduler_hierarchy`), `NONE` when absent
    pub fn hierarchical_scheduler(&self, id: ComponentId) -> ComponentId {
        ComponentId(self.scheduler_hierarchy.get(&id.0).copied().unwrap_or(0))
    }

    /// Human-readable name of a component
    pub fn name(&self, id: ComponentId) -> Option<&str> {
        self.names.get(&id.0).map(String::as_str)
    }

    /// Components sharing the privileged address-space region
    pub fn shared_address_space(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.addrspc_shared.iter().map(|id| ComponentId(*id))
    }

    /// Pre-allocated shared-memory regions
    pub fn shmem_regions(&self) -> &[ShmemRegion] {
        &self.virt_resources.shmem
    }

    /// Frontiers of a booted component
    pub fn frontiers(&self, id: ComponentId) -> Frontiers {
        self.frontiers.get(&id.0).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SystemManifest {
        SystemManifest::from_json(
            r#"{
                "captbl_end": 40,
                "execute": [[6, "sched"], [5, "init"]],
                "scheduler_hierarchy": { "5": 6 },
                "init_hierarchy": { "6": 1 },
                "names": { "5": "client", "6": "sched" },
                "addrspc_shared": [5, 6],
                "virt_resources": { "shmem": [{ "id": 3, "size": 2 }] }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_value_lookup() {
        let m = sample();
        assert_eq!(m.value("captbl_end").as_deref(), Some("40"));
        assert_eq!(m.value("names/6").as_deref(), Some("sched"));
        assert_eq!(m.value("scheduler_hierarchy/5").as_deref(), Some("6"));
        assert_eq!(m.value("init_hierarchy/6").as_deref(), Some("1"));
        assert_eq!(m.value("init_hierarchy/5"), None);
        assert_eq!(m.value("names/notanumber"), None);
        assert_eq!(m.value("bogus/5"), None);
    }

    #[test]
    fn test_execution_plan_preserves_order() {
        let plan = sample().execution_plan().unwrap();
        assert_eq!(
            plan,
            vec![
                (ComponentId(6), ExecutionKind::Sched),
                (ComponentId(5), ExecutionKind::Init)
            ]
        );
    }

    #[test]
    fn test_unknown_execution_kind() {
        let mut m = sample();
        m.execute.push((7, "daemon".to_string()));
        assert_eq!(
            m.execution_plan(),
            Err(ManifestError::UnknownExecutionKind("daemon".to_string()))
        );
    }

    #[test]
    fn test_scheduler_lookups_default_to_none() {
        let m = sample();
        assert_eq!(m.hierarchical_scheduler(ComponentId(5)), ComponentId(6));
        assert_eq!(m.direct_scheduler(ComponentId(5)), ComponentId::NONE);
        assert_eq!(m.direct_scheduler(ComponentId(6)), ComponentId(1));
    }

    #[test]
    fn test_entry_len() {
        let m = sample();
        assert_eq!(m.entry_len("execute"), Some(2));
        assert_eq!(m.entry_len("addrspc_shared"), Some(2));
        assert_eq!(m.entry_len("virt_resources/shmem"), Some(1));
        assert_eq!(m.entry_len("names"), None);
    }

    #[test]
    fn test_malformed_json() {
        let err = SystemManifest::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn test_missing_sections_default() {
        let m = SystemManifest::from_json("{}").unwrap();
        assert!(m.execute.is_empty());
        assert!(m.shmem_regions().is_empty());
        assert_eq!(m.frontiers(ComponentId(5)), Frontiers::default());
    }

    #[test]
    fn test_json_roundtrip() {
        let m = sample();
        let json = m.to_json().unwrap();
        assert_eq!(SystemManifest::from_json(&json).unwrap(), m);
    }
}
