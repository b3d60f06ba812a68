//! End-to-end capability scenarios
//!
//! These tests drive capmgr through its request surface the way components
//! would:
//! - Thread creation gated by the scheduler table
//! - Receive/send endpoint pairs for schedulers
//! - Virtual machines and their managers
//! - Pool exhaustion surfacing as null replies

use core_types::{ComponentId, EntryIndex, ThreadId};
use kernel_api::{KernelApi, RcvFlags};
use services_capability_manager::{CapMgrEvent, CapMgrRequest, CapMgrResponse, ThreadAlias};
use tests_resilience::{as_component, client_and_scheduler, test_bootstrap, ManifestBuilder};

#[test]
fn test_scheduler_creates_thread_in_client() {
    let cm = test_bootstrap(&client_and_scheduler());

    let response = cm
        .dispatch(
            &as_component(6),
            &CapMgrRequest::CreateThread {
                client: ComponentId(5),
                entry: EntryIndex(1),
            },
        )
        .unwrap();
    let CapMgrResponse::Thread { cap, tid } = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(!cap.is_null());
    assert_ne!(tid, ThreadId(0));

    let thread = cm.find_thread(tid).unwrap();
    assert_eq!(thread.client, ComponentId(5));
    assert_eq!(thread.sched, ComponentId(6));
    assert_eq!(thread.alias, ThreadAlias::Aliased(cap));
    assert_eq!(cm.kernel().thread_owner(tid), Some(ComponentId(5)));
}

#[test]
fn test_non_scheduler_gets_null_thread() {
    let cm = test_bootstrap(&client_and_scheduler());
    let threads = cm.objects().thread_count();

    let response = cm
        .dispatch(
            &as_component(7),
            &CapMgrRequest::CreateThread {
                client: ComponentId(5),
                entry: EntryIndex(1),
            },
        )
        .unwrap();
    assert!(response.is_null());
    assert_eq!(cm.objects().thread_count(), threads);
    assert!(cm.audit_log().has_event(|e| matches!(
        e,
        CapMgrEvent::PermissionDenied { caller, target }
            if *caller == ComponentId(7) && *target == ComponentId(5)
    )));
}

#[test]
fn test_direct_assignment_overrides_hierarchy() {
    let manifest = client_and_scheduler().directly_scheduled_by(5, 7);
    let cm = test_bootstrap(&manifest);

    let init = CapMgrRequest::CreateInitThread {
        client: ComponentId(5),
    };
    assert!(cm.dispatch(&as_component(6), &init).unwrap().is_null());
    assert!(!cm.dispatch(&as_component(7), &init).unwrap().is_null());
}

#[test]
fn test_scheduler_receive_endpoint_pair() {
    let cm = test_bootstrap(&client_and_scheduler());

    let response = cm
        .dispatch(
            &as_component(6),
            &CapMgrRequest::CreateReceiveEndpoint {
                entry: EntryIndex(2),
                flags: RcvFlags::default(),
            },
        )
        .unwrap();
    let CapMgrResponse::ReceiveEndpoint(ep) = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(!ep.rcv.is_null() && !ep.asnd.is_null() && !ep.thread.is_null());
    assert!(cm
        .audit_log()
        .has_event(|e| matches!(e, CapMgrEvent::AsndCreated { owner } if *owner == ComponentId(6))));

    // A plain component has no scheduling endpoint to hang one off
    let refused = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::CreateReceiveEndpoint {
                entry: EntryIndex(2),
                flags: RcvFlags::default(),
            },
        )
        .unwrap();
    assert!(refused.is_null());
}

#[test]
fn test_vm_lifecycle() {
    let cm = test_bootstrap(&client_and_scheduler());
    let manager = as_component(7);

    let CapMgrResponse::Component(vm) = cm
        .dispatch(&manager, &CapMgrRequest::CreateVmComponent)
        .unwrap()
    else {
        panic!("expected a component");
    };
    assert!(vm.is_some());
    assert_eq!(cm.kernel().component_name(vm).as_deref(), Some("vmlinux"));

    let vcpu = CapMgrRequest::CreateVcpu {
        vm,
        entry: EntryIndex(0),
    };
    assert!(!cm.dispatch(&manager, &vcpu).unwrap().is_null());
    assert!(cm.dispatch(&as_component(6), &vcpu).unwrap().is_null());

    let CapMgrResponse::Span { span, .. } = cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::AllocateSharedPages {
                count: 2,
                align: None,
            },
        )
        .unwrap()
    else {
        panic!("expected a span");
    };
    let into_vm = CapMgrRequest::MapSharedSpanInVm {
        vm,
        span,
        align: None,
    };
    let CapMgrResponse::Mapped { pages, vaddr } = cm.dispatch(&manager, &into_vm).unwrap() else {
        panic!("expected a mapping");
    };
    assert_eq!(pages, 2);
    assert!(cm.kernel().translate(vm, vaddr).is_some());
    assert!(cm.dispatch(&as_component(5), &into_vm).unwrap().is_null());
}

#[test]
fn test_thread_pool_exhaustion_is_recoverable() {
    let cm = test_bootstrap(&client_and_scheduler());
    let capacity = cm.config().max_threads;
    let request = CapMgrRequest::CreateThread {
        client: ComponentId(5),
        entry: EntryIndex(1),
    };

    let before = cm.objects().thread_count();

    let created = (0..capacity + 4)
        .map(|_| cm.dispatch(&as_component(6), &request).unwrap())
        .filter(|r| !r.is_null())
        .count();
    assert_eq!(created, capacity - before);
    assert_eq!(cm.objects().thread_count(), capacity);

    // Still serving
    assert!(!cm
        .dispatch(
            &as_component(5),
            &CapMgrRequest::AllocateHeapPages {
                count: 1,
                align: None
            }
        )
        .unwrap()
        .is_null());
}

#[test]
fn test_thunk_needs_known_caller() {
    let cm = test_bootstrap(&ManifestBuilder::new().component(5, "lonely"));
    let request = CapMgrRequest::CreateThreadThunk {
        entry: EntryIndex(3),
    };
    assert!(!cm.dispatch(&as_component(5), &request).unwrap().is_null());
    assert!(cm.dispatch(&as_component(9), &request).unwrap().is_null());
}
