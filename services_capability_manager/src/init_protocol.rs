//! Component initialization protocol
//!
//! Each component listed in the manifest's execution plan moves through
//!
//! ```text
//! Unregistered ──begin──▶ Initializing ──first done──▶ ParallelInit ──all arrived──▶ Main
//! ```
//!
//! - `begin` happens once, whichever core gets there first, and asks the
//!   scheduler to run the component's serial initialization.
//! - The first `done` latches the init core with a compare-and-swap and
//!   fixes how many cores the barrier waits for: all of them when parallel
//!   initialization was requested, only the init core otherwise.
//! - Every arrival but the last parks in the scheduler; the last one moves
//!   the component to `Main` and releases the rest.
//! - A `done` in `Main` (or beyond the expected arrivals) is the calling
//!   thread leaving, and is routed to thread teardown.
//!
//! The registry never blocks by itself. Parking and waking are the
//! scheduler's job.

use crate::audit::{AuditTrail, CapMgrEvent};
use crate::error::CapMgrError;
use core_types::{ComponentId, CoreId};
use kernel_api::SchedulerApi;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

const NO_CORE: usize = usize::MAX;

/// Where a component is in its initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InitState {
    Unregistered = 0,
    Initializing = 1,
    ParallelInit = 2,
    Main = 3,
}

impl InitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => InitState::Initializing,
            2 => InitState::ParallelInit,
            3 => InitState::Main,
            _ => InitState::Unregistered,
        }
    }
}

/// What a component runs once initialization completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InitMain {
    /// No main; threads exit after the barrier
    #[default]
    None = 0,
    /// Main runs on the init core only
    Serial = 1,
    /// Main runs on every core
    Parallel = 2,
}

impl InitMain {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => InitMain::Serial,
            2 => InitMain::Parallel,
            _ => InitMain::None,
        }
    }
}

/// Result of signaling initialization done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitOutcome {
    /// Past the barrier; continue as the component's main says
    Main(InitMain),
    /// The calling thread was torn down
    Exited,
}

#[derive(Debug)]
struct ComponentInit {
    state: AtomicU8,
    init_core: AtomicUsize,
    expected: AtomicUsize,
    arrived: AtomicUsize,
    main: AtomicU8,
}

impl ComponentInit {
    fn new(cores: usize) -> Self {
        Self {
            state: AtomicU8::new(InitState::Unregistered as u8),
            init_core: AtomicUsize::new(NO_CORE),
            expected: AtomicUsize::new(cores),
            arrived: AtomicUsize::new(0),
            main: AtomicU8::new(InitMain::None as u8),
        }
    }

    fn state(&self) -> InitState {
        InitState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Initialization state of every component in the execution plan
#[derive(Debug)]
pub struct InitRegistry {
    components: BTreeMap<ComponentId, ComponentInit>,
    audit: Arc<AuditTrail>,
}

impl InitRegistry {
    pub fn new(
        components: impl IntoIterator<Item = ComponentId>,
        cores: usize,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let cores = cores.max(1);
        Self {
            components: components
                .into_iter()
                .map(|id| (id, ComponentInit::new(cores)))
                .collect(),
            audit,
        }
    }

    fn entry(&self, id: ComponentId) -> Result<&ComponentInit, CapMgrError> {
        self.components
            .get(&id)
            .ok_or(CapMgrError::InitNotStarted(id))
    }

    fn transition(&self, component: ComponentId, state: InitState) {
        self.audit
            .record(CapMgrEvent::InitTransition { component, state });
    }

    pub fn state(&self, id: ComponentId) -> Option<InitState> {
        self.components.get(&id).map(ComponentInit::state)
    }

    /// The core that completed serial initialization
    pub fn init_core(&self, id: ComponentId) -> Option<CoreId> {
        self.components
            .get(&id)
            .map(|c| c.init_core.load(Ordering::Acquire))
            .filter(|core| *core != NO_CORE)
            .map(CoreId)
    }

    /// Starts initialization of `id` unless another core already has
    ///
    /// Returns whether this call started it.
    pub fn begin<S: SchedulerApi + ?Sized>(
        &self,
        sched: &S,
        id: ComponentId,
        core: CoreId,
    ) -> Result<bool, CapMgrError> {
        let entry = self.entry(id)?;
        let started = entry
            .state
            .compare_exchange(
                InitState::Unregistered as u8,
                InitState::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started {
            self.transition(id, InitState::Initializing);
            debug!("capmgr: scheduling initialization of {} from {}", id, core);
            sched.schedule_init(id, core);
        }
        Ok(started)
    }

    /// A thread of `id` on `core` finished its initialization step
    pub fn done<S: SchedulerApi + ?Sized>(
        &self,
        sched: &S,
        id: ComponentId,
        core: CoreId,
        parallel: bool,
        main: InitMain,
    ) -> Result<InitOutcome, CapMgrError> {
        let entry = self.entry(id)?;
        loop {
            match entry.state() {
                InitState::Unregistered => return Err(CapMgrError::InitNotStarted(id)),
                InitState::Initializing => {
                    let latched = entry
                        .init_core
                        .compare_exchange(NO_CORE, core.0, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if latched {
                        if !parallel {
                            entry.expected.store(1, Ordering::Release);
                        }
                        entry.main.store(main as u8, Ordering::Release);
                        entry
                            .state
                            .store(InitState::ParallelInit as u8, Ordering::Release);
                        self.transition(id, InitState::ParallelInit);
                        return Ok(self.arrive(sched, entry, id, core));
                    }
                    // The init core is publishing; it moves on immediately
                    std::hint::spin_loop();
                }
                InitState::ParallelInit => return Ok(self.arrive(sched, entry, id, core)),
                InitState::Main => {
                    sched.thread_exit(id, core);
                    return Ok(InitOutcome::Exited);
                }
            }
        }
    }

    fn arrive<S: SchedulerApi + ?Sized>(
        &self,
        sched: &S,
        entry: &ComponentInit,
        id: ComponentId,
        core: CoreId,
    ) -> InitOutcome {
        let arrived = entry.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        let expected = entry.expected.load(Ordering::Acquire);
        let main = InitMain::from_u8(entry.main.load(Ordering::Acquire));

        if arrived > expected {
            sched.thread_exit(id, core);
            return InitOutcome::Exited;
        }
        if arrived == expected {
            entry.state.store(InitState::Main as u8, Ordering::Release);
            self.transition(id, InitState::Main);
            info!("capmgr: {} initialized on {} core(s)", id, expected);
            sched.release(id);
        } else {
            sched.block_until_released(id, core);
        }
        InitOutcome::Main(main)
    }

    /// `id` exited with `retval`
    pub fn exit<S: SchedulerApi + ?Sized>(
        &self,
        sched: &S,
        id: ComponentId,
        retval: i32,
    ) -> Result<(), CapMgrError> {
        self.entry(id)?;
        sched.component_exit(id, retval);
        self.audit.record(CapMgrEvent::ComponentExited {
            component: id,
            retval,
        });
        info!("capmgr: {} exited with {}", id, retval);
        Ok(())
    }
}
