//! Boot-time defects
//!
//! A manifest that disagrees with itself, or a kernel that breaks a memory
//! guarantee while capmgr is coming up, must stop boot with a defect.
//! Nothing here is recoverable: there is no client to report to yet.

use core_types::{ComponentId, CoreId};
use kernel_api::KernelError;
use manifest::ManifestError;
use services_capability_manager::{CapMgrConfig, FatalDefect, PoolError};
use sim_kernel::fault_injection::{FaultPlan, KernelFault};
use sim_kernel::SimulatedKernel;
use tests_resilience::{
    bootstrap_with, client_and_scheduler, try_bootstrap, ManifestBuilder, CAPMGR,
};

fn boot_error(manifest: &ManifestBuilder) -> FatalDefect {
    match try_bootstrap(manifest) {
        Ok(_) => panic!("boot should have failed"),
        Err(defect) => defect,
    }
}

#[test]
fn test_well_formed_system_boots() {
    let cm = try_bootstrap(&client_and_scheduler().shmem(3, 2)).unwrap();
    assert!(cm.objects().has_component(ComponentId(5)));
    assert_eq!(cm.memory().span(3).unwrap().n_pages, 2);
    assert_eq!(
        cm.memory().contig_capacity(),
        CapMgrConfig::for_tests().contig_pages
    );
}

#[test]
fn test_unknown_execution_kind() {
    let manifest = client_and_scheduler().execute(7, "daemon");
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::Manifest(ManifestError::UnknownExecutionKind("daemon".to_string()))
    );
}

#[test]
fn test_captbl_triple_with_mixed_targets() {
    let manifest = ManifestBuilder::new()
        .raw_cap(10, "comp", 5)
        .raw_cap(11, "captbl", 5)
        .raw_cap(12, "pgtbl", 6);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::Manifest(ManifestError::InconsistentCaptbl {
            capid: 12,
            expected: ComponentId(5),
            found: ComponentId(6),
        })
    );
}

#[test]
fn test_truncated_captbl() {
    let manifest = client_and_scheduler()
        .raw_cap(60, "comp", 8)
        .raw_cap(61, "captbl", 8);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::Manifest(ManifestError::IncompleteCaptbl(ComponentId(8)))
    );
}

#[test]
fn test_component_without_name() {
    let manifest = client_and_scheduler()
        .raw_cap(60, "comp", 8)
        .raw_cap(61, "captbl", 8)
        .raw_cap(62, "pgtbl", 8);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::MissingName(ComponentId(8))
    );
}

#[test]
fn test_captbl_end_below_free_slot() {
    let manifest = client_and_scheduler().captbl_end(3);
    assert!(matches!(
        boot_error(&manifest),
        FatalDefect::CaptblEndTooLow { captbl_end: 3, .. }
    ));
}

#[test]
fn test_shared_address_space_for_unknown_component() {
    let manifest = client_and_scheduler().shared_address_space(42);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::ComponentMissing(ComponentId(42))
    );
}

#[test]
fn test_components_sharing_a_page_table_map_once() {
    let manifest = client_and_scheduler()
        .shared_address_space(5)
        .shared_address_space(5);
    let cm = try_bootstrap(&manifest).unwrap();
    assert!(cm.kernel().is_ulk_mapped(ComponentId(5)));
    assert!(!cm.kernel().is_ulk_mapped(ComponentId(6)));
}

#[test]
fn test_shmem_id_beyond_span_pool() {
    let capacity = CapMgrConfig::for_tests().max_spans as u32;
    let manifest = client_and_scheduler().shmem(capacity + 1, 1);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::Pool(PoolError::OutOfRange {
            pool: "span",
            index: capacity + 1,
        })
    );
}

#[test]
fn test_duplicate_shmem_id() {
    let manifest = client_and_scheduler().shmem(4, 1).shmem(4, 2);
    assert_eq!(
        boot_error(&manifest),
        FatalDefect::Pool(PoolError::Occupied {
            pool: "span",
            index: 4,
        })
    );
}

#[test]
fn test_discontiguous_contig_region() {
    let kernel = SimulatedKernel::new(CAPMGR)
        .with_fault_plan(FaultPlan::new().with_fault(KernelFault::DiscontiguousAlias));
    let err = bootstrap_with(&client_and_scheduler(), CapMgrConfig::for_tests(), kernel);
    assert!(matches!(
        err,
        Err(FatalDefect::ContiguityViolation { component, .. }) if component == CAPMGR
    ));
}

#[test]
fn test_no_memory_for_contig_region() {
    let kernel = SimulatedKernel::new(CAPMGR)
        .with_fault_plan(FaultPlan::new().with_fault(KernelFault::FailFrameReserve));
    let err = bootstrap_with(&client_and_scheduler(), CapMgrConfig::for_tests(), kernel);
    assert!(matches!(
        err,
        Err(FatalDefect::Kernel(KernelError::OutOfMemory))
    ));
}

#[test]
fn test_execution_in_capmgr_itself() {
    let manifest = client_and_scheduler().execute(CAPMGR.0, "init");
    let cm = try_bootstrap(&manifest).unwrap();
    assert_eq!(
        cm.parallel_init(CoreId(0), true),
        Err(FatalDefect::SelfExecution(CAPMGR))
    );
}
