//! Simulated scheduler collaborator
//!
//! The scheduler owns run queues and the actual blocking of threads; capmgr
//! only tells it what its initialization protocol decided. This simulation
//! records every request in order and really blocks callers of
//! `block_until_released`, so barrier behavior can be tested with OS threads.
//!
//! ## Philosophy
//!
//! - **Mechanism, not policy**: No run queues, no quanta. Only the hooks
//!   capmgr drives.
//! - **Real blocking**: A blocked caller waits on a condition variable until
//!   its component is released, exactly like a thread parked at a barrier.
//! - **Inspectable**: Every hook call leaves a `SchedEvent`.

use core_types::{ComponentId, CoreId};
use kernel_api::SchedulerApi;
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A request capmgr made of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    InitScheduled { component: ComponentId, core: CoreId },
    Blocked { component: ComponentId, core: CoreId },
    Released { component: ComponentId },
    ThreadExited { component: ComponentId, core: CoreId },
    ComponentExited { component: ComponentId, retval: i32 },
}

#[derive(Debug, Default)]
struct SchedState {
    events: Vec<SchedEvent>,
    released: BTreeSet<ComponentId>,
    waiting: usize,
}

/// Simulated scheduler
#[derive(Debug, Default)]
pub struct SimulatedScheduler {
    state: Mutex<SchedState>,
    wakeup: Condvar,
}

impl SimulatedScheduler {
    /// Creates a scheduler with nothing recorded
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All requests so far, in order
    pub fn events(&self) -> Vec<SchedEvent> {
        self.lock().events.clone()
    }

    /// Counts recorded requests matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SchedEvent) -> bool,
    {
        self.lock().events.iter().filter(|e| predicate(e)).count()
    }

    /// Whether `component` has been released from its barrier
    pub fn is_released(&self, component: ComponentId) -> bool {
        self.lock().released.contains(&component)
    }

    /// Number of callers currently parked in `block_until_released`
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }
}

impl SchedulerApi for SimulatedScheduler {
    fn schedule_init(&self, component: ComponentId, core: CoreId) {
        self.lock()
            .events
            .push(SchedEvent::InitScheduled { component, core });
    }

    fn block_until_released(&self, component: ComponentId, core: CoreId) {
        let mut state = self.lock();
        state.events.push(SchedEvent::Blocked { component, core });
        state.waiting += 1;
        while !state.released.contains(&component) {
            state = self
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting -= 1;
    }

    fn release(&self, component: ComponentId) {
        let mut state = self.lock();
        state.released.insert(component);
        state.events.push(SchedEvent::Released { component });
        self.wakeup.notify_all();
    }

    fn thread_exit(&self, component: ComponentId, core: CoreId) {
        self.lock()
            .events
            .push(SchedEvent::ThreadExited { component, core });
    }

    fn component_exit(&self, component: ComponentId, retval: i32) {
        self.lock()
            .events
            .push(SchedEvent::ComponentExited { component, retval });
    }
}
