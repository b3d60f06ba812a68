//! Capability-table replay entries
//!
//! For every component booted before capmgr, the composer places three
//! capabilities in capmgr's table: the component, its capability table and
//! its page table. They appear consecutively, ordered by capid.

use crate::ManifestError;
use core_types::ComponentId;
use serde::{Deserialize, Serialize};

/// Kind of a replayed capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapType {
    Comp,
    Captbl,
    Pgtbl,
}

impl CapType {
    fn parse(capid: u64, raw: &str) -> Result<Self, ManifestError> {
        match raw {
            "comp" => Ok(CapType::Comp),
            "captbl" => Ok(CapType::Captbl),
            "pgtbl" => Ok(CapType::Pgtbl),
            other => Err(ManifestError::UnknownCapType {
                capid,
                cap_type: other.to_string(),
            }),
        }
    }
}

/// One `captbl` entry as written by the composer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptblEntry {
    pub capid: u64,
    #[serde(rename = "type")]
    pub cap_type: String,
    pub target: u64,
}

/// The three capabilities capmgr holds for one booted component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentCaps {
    pub component: ComponentId,
    pub comp: u64,
    pub captbl: u64,
    pub pgtbl: u64,
}

pub(crate) fn group(entries: &[CaptblEntry]) -> Result<Vec<ComponentCaps>, ManifestError> {
    let mut groups = Vec::with_capacity(entries.len() / 3);

    for chunk in entries.chunks(3) {
        let component = ComponentId(chunk[0].target);
        if chunk.len() < 3 {
            return Err(ManifestError::IncompleteCaptbl(component));
        }

        let mut comp = 0;
        let mut captbl = 0;
        let mut pgtbl = 0;
        for entry in chunk {
            if entry.capid == 0 {
                return Err(ManifestError::InvalidCapId);
            }
            if entry.target != component.0 {
                return Err(ManifestError::InconsistentCaptbl {
                    capid: entry.capid,
                    expected: component,
                    found: ComponentId(entry.target),
                });
            }
            match CapType::parse(entry.capid, &entry.cap_type)? {
                CapType::Comp => comp = entry.capid,
                CapType::Captbl => captbl = entry.capid,
                CapType::Pgtbl => pgtbl = entry.capid,
            }
        }

        if !component.is_some() || comp == 0 || captbl == 0 || pgtbl == 0 {
            return Err(ManifestError::IncompleteCaptbl(component));
        }
        groups.push(ComponentCaps {
            component,
            comp,
            captbl,
            pgtbl,
        });
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(capid: u64, cap_type: &str, target: u64) -> CaptblEntry {
        CaptblEntry {
            capid,
            cap_type: cap_type.to_string(),
            target,
        }
    }

    #[test]
    fn test_group_triples() {
        let entries = vec![
            entry(10, "comp", 5),
            entry(11, "captbl", 5),
            entry(12, "pgtbl", 5),
            entry(13, "pgtbl", 6),
            entry(14, "comp", 6),
            entry(15, "captbl", 6),
        ];
        let groups = group(&entries).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[1],
            ComponentCaps {
                component: ComponentId(6),
                comp: 14,
                captbl: 15,
                pgtbl: 13
            }
        );
    }

    #[test]
    fn test_inconsistent_target() {
        let entries = vec![
            entry(10, "comp", 5),
            entry(11, "captbl", 7),
            entry(12, "pgtbl", 5),
        ];
        assert_eq!(
            group(&entries),
            Err(ManifestError::InconsistentCaptbl {
                capid: 11,
                expected: ComponentId(5),
                found: ComponentId(7)
            })
        );
    }

    #[test]
    fn test_unknown_type() {
        let entries = vec![
            entry(10, "comp", 5),
            entry(11, "sinv", 5),
            entry(12, "pgtbl", 5),
        ];
        assert!(matches!(
            group(&entries),
            Err(ManifestError::UnknownCapType { capid: 11, .. })
        ));
    }

    #[test]
    fn test_duplicate_type_is_incomplete() {
        let entries = vec![
            entry(10, "comp", 5),
            entry(11, "comp", 5),
            entry(12, "pgtbl", 5),
        ];
        assert_eq!(
            group(&entries),
            Err(ManifestError::IncompleteCaptbl(ComponentId(5)))
        );
    }

    #[test]
    fn test_trailing_partial_group() {
        let entries = vec![entry(10, "comp", 5), entry(11, "captbl", 5)];
        assert_eq!(
            group(&entries),
            Err(ManifestError::IncompleteCaptbl(ComponentId(5)))
        );
    }

    #[test]
    fn test_zero_capid() {
        let entries = vec![
            entry(0, "comp", 5),
            entry(11, "captbl", 5),
            entry(12, "pgtbl", 5),
        ];
        assert_eq!(group(&entries), Err(ManifestError::InvalidCapId));
    }
}
