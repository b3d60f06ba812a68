//! Memory under pressure
//!
//! Sharing, alignment and exhaustion through the request surface. Every
//! shortage must come back as a null reply while the service keeps going.

use core_types::{ComponentId, Paddr, Vaddr, PAGE_SIZE};
use kernel_api::KernelApi;
use proptest::prelude::*;
use services_capability_manager::{
    CapMgrConfig, CapMgrEvent, CapMgrRequest, CapMgrResponse, FatalDefect, MM_MAPPINGS_MAX,
};
use sim_kernel::fault_injection::{FaultPlan, KernelFault};
use sim_kernel::SimulatedKernel;
use tests_resilience::{
    as_component, bootstrap_with, client_and_scheduler, test_bootstrap, ManifestBuilder,
    TestCapMgr, CAPMGR,
};

/// Components 5..=10, enough to run every mapping slot out
fn crowd() -> ManifestBuilder {
    (5..=10).fold(ManifestBuilder::new(), |m, id| {
        m.component(id, &format!("comp{}", id))
    })
}

fn shared_pages(cm: &TestCapMgr, caller: u64, count: usize) -> (u32, Vaddr) {
    match cm
        .dispatch(
            &as_component(caller),
            &CapMgrRequest::AllocateSharedPages { count, align: None },
        )
        .unwrap()
    {
        CapMgrResponse::Span { span, vaddr } => (span, vaddr),
        other => panic!("unexpected response {other:?}"),
    }
}

fn map_span(cm: &TestCapMgr, caller: u64, span: u32) -> CapMgrResponse {
    cm.dispatch(
        &as_component(caller),
        &CapMgrRequest::MapSharedSpan { span, align: None },
    )
    .unwrap()
}

#[test]
fn test_shared_pages_seen_by_second_component() {
    let cm = test_bootstrap(&client_and_scheduler());
    let (span, v1) = shared_pages(&cm, 5, 3);

    let CapMgrResponse::Mapped { pages, vaddr: v2 } = map_span(&cm, 6, span) else {
        panic!("span did not map");
    };
    assert_eq!(pages, 3);
    for page in 0..3 {
        assert_eq!(
            cm.kernel().translate(ComponentId(5), v1.add_pages(page)),
            cm.kernel().translate(ComponentId(6), v2.add_pages(page))
        );
    }
}

#[test]
fn test_span_fan_out_stops_at_slot_limit() {
    let cm = test_bootstrap(&crowd());
    let (span, _) = shared_pages(&cm, 5, 1);

    let mapped: Vec<bool> = (6..=10)
        .map(|id| !map_span(&cm, id, span).is_null())
        .collect();
    assert_eq!(
        mapped.iter().filter(|m| **m).count(),
        MM_MAPPINGS_MAX - 1
    );
    assert!(!mapped[MM_MAPPINGS_MAX - 1]);

    // The page record lists the owner plus every successful mapper
    let record = cm.memory().span(span).unwrap();
    let page = cm.memory().page_at(record.page_off).unwrap();
    assert_eq!(page.mappings().len(), MM_MAPPINGS_MAX);
}

#[test]
fn test_unmapped_page_fans_out_to_every_slot() {
    let cm = test_bootstrap(&crowd());
    let memory = cm.memory();
    let page = memory.allocate_page(cm.kernel(), None, PAGE_SIZE).unwrap();

    for id in 5..5 + MM_MAPPINGS_MAX as u64 {
        memory
            .alias_page(cm.kernel(), page, ComponentId(id), PAGE_SIZE)
            .unwrap();
    }
    assert!(memory
        .alias_page(cm.kernel(), page, ComponentId(10), PAGE_SIZE)
        .is_err());

    let frame = memory.page(page).unwrap().frame();
    for mapping in memory.page(page).unwrap().mappings() {
        assert_eq!(
            cm.kernel().translate(mapping.component, mapping.vaddr),
            Some(frame)
        );
    }
}

#[test]
fn test_unknown_span_is_null() {
    let cm = test_bootstrap(&client_and_scheduler());
    assert!(map_span(&cm, 5, 17).is_null());
}

#[test]
fn test_page_pool_exhaustion_is_null() {
    let cm = test_bootstrap(&client_and_scheduler());
    let too_many = CapMgrConfig::for_tests().max_pages + 1;

    let response = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::AllocateHeapPages {
                count: too_many,
                align: None,
            },
        )
        .unwrap();
    assert_eq!(response, CapMgrResponse::Address(Vaddr(0)));
    assert_eq!(cm.memory().page_count(), 0);

    let small = CapMgrRequest::AllocateHeapPages {
        count: 2,
        align: None,
    };
    assert!(!cm.dispatch(&as_component(5), &small).unwrap().is_null());
}

#[test]
fn test_out_of_frames_is_null() {
    let kernel = SimulatedKernel::new(CAPMGR)
        .with_fault_plan(FaultPlan::new().with_fault(KernelFault::FailFrameReserve));
    let config = CapMgrConfig {
        contig_pages: 0,
        ..CapMgrConfig::for_tests()
    };
    let cm = bootstrap_with(&client_and_scheduler(), config, kernel).unwrap();

    let request = CapMgrRequest::AllocateHeapPages {
        count: 1,
        align: None,
    };
    assert!(cm.dispatch(&as_component(5), &request).unwrap().is_null());
    // The page records reserved for the failed request were returned
    assert_eq!(cm.memory().page_count(), 0);
    assert!(!cm.dispatch(&as_component(5), &request).unwrap().is_null());
}

#[test]
fn test_discontiguous_heap_halts_service() {
    let kernel = SimulatedKernel::new(CAPMGR)
        .with_fault_plan(FaultPlan::new().with_fault(KernelFault::DiscontiguousAlias));
    let config = CapMgrConfig {
        contig_pages: 0,
        ..CapMgrConfig::for_tests()
    };
    let cm = bootstrap_with(&client_and_scheduler(), config, kernel).unwrap();

    let requests = vec![
        (
            as_component(5),
            CapMgrRequest::AllocateHeapPages {
                count: 1,
                align: None,
            },
        ),
        (
            as_component(5),
            CapMgrRequest::AllocateHeapPages {
                count: 4,
                align: None,
            },
        ),
        (
            as_component(6),
            CapMgrRequest::AllocateHeapPages {
                count: 1,
                align: None,
            },
        ),
    ];
    let halt = cm.serve(requests).unwrap_err();
    assert_eq!(halt.served, 1);
    assert!(matches!(
        halt.defect,
        FatalDefect::ContiguityViolation { component, .. } if component == ComponentId(5)
    ));
}

#[test]
fn test_absurd_page_counts_are_null() {
    let cm = test_bootstrap(&client_and_scheduler());
    let requests = [
        CapMgrRequest::AllocateHeapPages {
            count: usize::MAX,
            align: None,
        },
        CapMgrRequest::AllocateSharedPages {
            count: usize::MAX,
            align: None,
        },
        CapMgrRequest::AllocateContiguousPages { count: usize::MAX },
        CapMgrRequest::AllocateContiguousShared {
            count: usize::MAX,
            align: None,
        },
    ];
    for request in &requests {
        let response = cm.dispatch(&as_component(5), request).unwrap();
        assert_eq!(response, CapMgrResponse::null_for(request));
    }
    assert_eq!(cm.memory().page_count(), 0);
    assert_eq!(cm.memory().contig_used(), 0);

    // Still serving
    let heap = CapMgrRequest::AllocateHeapPages {
        count: 1,
        align: None,
    };
    assert!(!cm.dispatch(&as_component(5), &heap).unwrap().is_null());
}

#[test]
fn test_invalid_alignment_is_null() {
    let cm = test_bootstrap(&client_and_scheduler());
    for align in [0, PAGE_SIZE / 2, 3 * PAGE_SIZE] {
        let request = CapMgrRequest::AllocateHeapPages {
            count: 1,
            align: Some(align),
        };
        assert!(cm.dispatch(&as_component(5), &request).unwrap().is_null());
    }
    assert_eq!(cm.memory().page_count(), 0);
}

#[test]
fn test_contiguous_region_runs_out() {
    let cm = test_bootstrap(&client_and_scheduler());
    let capacity = cm.memory().contig_capacity();
    let request = CapMgrRequest::AllocateContiguousPages { count: 16 };

    let granted = (0..capacity / 16 + 2)
        .map(|_| cm.dispatch(&as_component(5), &request).unwrap())
        .filter(|r| !r.is_null())
        .count();
    assert_eq!(granted, capacity / 16);
    assert_eq!(cm.memory().contig_used(), capacity);

    // Ordinary heap allocation is unaffected
    let heap = CapMgrRequest::AllocateHeapPages {
        count: 16,
        align: None,
    };
    assert!(!cm.dispatch(&as_component(5), &heap).unwrap().is_null());
}

#[test]
fn test_contiguous_allocations_are_monotonic() {
    let cm = test_bootstrap(&client_and_scheduler());
    let ctx = as_component(5);

    let mut last: Option<Paddr> = None;
    for count in [1, 2, 5, 3] {
        let vaddr = cm.allocate_contiguous_pages(&ctx, count).unwrap();
        let paddr = cm.translate_virtual_to_physical(&ctx, vaddr).unwrap();
        if let Some(previous) = last {
            assert!(paddr.0 > previous.0);
        }
        last = Some(paddr.add_pages(count as u64 - 1));
    }
    assert_eq!(cm.memory().contig_used(), 11);
}

#[test]
fn test_contiguous_shared_span_maps_elsewhere() {
    let cm = test_bootstrap(&client_and_scheduler());
    let CapMgrResponse::Span { span, vaddr } = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::AllocateContiguousShared {
                count: 4,
                align: Some(4 * PAGE_SIZE),
            },
        )
        .unwrap()
    else {
        panic!("expected a span");
    };
    assert!(vaddr.is_aligned(4 * PAGE_SIZE));

    let CapMgrResponse::Mapped { vaddr: theirs, .. } = map_span(&cm, 6, span) else {
        panic!("span did not map");
    };
    assert_eq!(
        cm.kernel().translate(ComponentId(5), vaddr.add_pages(3)),
        cm.kernel().translate(ComponentId(6), theirs.add_pages(3))
    );
}

#[test]
fn test_physical_region_mapping() {
    let cm = test_bootstrap(&client_and_scheduler());
    let device = Paddr(0xfee0_0000);

    let CapMgrResponse::Address(vaddr) = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::MapPhysicalRegion {
                paddr: device,
                size: 2 * PAGE_SIZE,
            },
        )
        .unwrap()
    else {
        panic!("expected an address");
    };
    assert!(!vaddr.is_null());

    let CapMgrResponse::Physical(paddr) = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::TranslateVirtualToPhysical {
                vaddr: vaddr.add_pages(1),
            },
        )
        .unwrap()
    else {
        panic!("expected an address");
    };
    assert_eq!(paddr, device.add_pages(1));
    assert!(cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::MapPhysicalRegion {
                paddr: device,
                size: 0,
            },
        )
        .unwrap()
        .is_null());
}

#[test]
fn test_memory_events_are_audited() {
    let cm = test_bootstrap(&client_and_scheduler());
    let (span, _) = shared_pages(&cm, 5, 2);
    map_span(&cm, 6, span);

    let log = cm.audit_log();
    assert!(log.has_event(|e| matches!(e, CapMgrEvent::PagesAllocated { component, count, .. }
        if *component == Some(ComponentId(5)) && *count == 2)));
    assert!(log.has_event(|e| matches!(e, CapMgrEvent::SpanMapped { span: s, into, .. }
        if *s == span && *into == ComponentId(6))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_heap_pages_honor_alignment(count in 1usize..6, shift in 0u32..5) {
        let cm = test_bootstrap(&client_and_scheduler());
        let align = PAGE_SIZE << shift;
        let ctx = as_component(5);

        let vaddr = cm.allocate_heap_pages(&ctx, count, Some(align)).unwrap();
        prop_assert!(vaddr.is_aligned(align));

        let first = cm.translate_virtual_to_physical(&ctx, vaddr).unwrap();
        for page in 1..count as u64 {
            prop_assert_eq!(
                cm.translate_virtual_to_physical(&ctx, vaddr.add_pages(page)),
                Ok(first.add_pages(page))
            );
        }
    }
}
