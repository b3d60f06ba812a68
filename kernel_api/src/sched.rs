//! Scheduler hooks used by the initialization protocol
//!
//! The scheduler owns run queues and the actual blocking of threads. capmgr
//! only tells it what the initialization protocol decided.

use core_types::{ComponentId, CoreId};

/// The scheduler collaborator
pub trait SchedulerApi: Send + Sync {
    /// Runs the serial initialization of `component`, driven from `core`
    fn schedule_init(&self, component: ComponentId, core: CoreId);

    /// Blocks the calling thread of `component` until [`SchedulerApi::release`]
    fn block_until_released(&self, component: ComponentId, core: CoreId);

    /// Wakes every thread of `component` blocked at its initialization barrier
    fn release(&self, component: ComponentId);

    /// Tears down the calling thread of `component` on `core`
    fn thread_exit(&self, component: ComponentId, core: CoreId);

    /// Records that `component` exited with `retval`
    fn component_exit(&self, component: ComponentId, retval: i32);
}
