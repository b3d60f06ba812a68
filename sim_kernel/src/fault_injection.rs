//! Deterministic fault injection for testing
//!
//! This module lets tests make individual kernel primitives fail, so the
//! rollback and leak paths in capmgr can be exercised without a real kernel.
//!
//! ## Design Philosophy
//!
//! - **Deterministic**: No randomness; faults fire in the order they were planned
//! - **One-shot**: Each planned fault fires once, on the next matching call
//! - **Test-focused**: Not intended for production use
//!
//! ## Example
//!
//! ```
//! use sim_kernel::fault_injection::{FaultInjector, FaultPlan, KernelFault};
//!
//! let plan = FaultPlan::new()
//!     .with_fault(KernelFault::FailThreadAlias)
//!     .with_fault(KernelFault::FailFrameReserve);
//! let mut injector = FaultInjector::new(plan);
//!
//! assert!(injector.take(KernelFault::FailThreadAlias));
//! assert!(!injector.take(KernelFault::FailThreadAlias));
//! ```

/// A kernel primitive failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFault {
    /// The next `thread_create` fails
    FailThreadCreate,
    /// The next `thread_alias` fails
    FailThreadAlias,
    /// The next `rcv_create` fails
    FailRcvCreate,
    /// The next `rcv_alias` fails
    FailRcvAlias,
    /// The next `asnd_alias` fails
    FailAsndAlias,
    /// The next `frames_reserve` reports out of memory
    FailFrameReserve,
    /// The next multi-frame `frames_alias` leaves a physical gap before its last page
    DiscontiguousAlias,
}

/// A plan describing all faults to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Vec<KernelFault>,
}

impl FaultPlan {
    /// Creates a new empty fault plan
    pub fn new() -> Self {
        Self { faults: Vec::new() }
    }

    /// Adds a fault to the plan
    pub fn with_fault(mut self, fault: KernelFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Returns the planned faults
    pub fn faults(&self) -> &[KernelFault] {
        &self.faults
    }
}

/// Tracks which planned faults have not fired yet
#[derive(Debug, Default)]
pub struct FaultInjector {
    pending: Vec<KernelFault>,
    fired: usize,
}

impl FaultInjector {
    /// Creates a new fault injector with the given plan
    pub fn new(plan: FaultPlan) -> Self {
        Self {
            pending: plan.faults,
            fired: 0,
        }
    }

    /// Consumes one pending `fault`, returning whether it was pending
    pub fn take(&mut self, fault: KernelFault) -> bool {
        match self.pending.iter().position(|f| *f == fault) {
            Some(pos) => {
                self.pending.remove(pos);
                self.fired += 1;
                true
            }
            None => false,
        }
    }

    /// Number of faults that have fired
    pub fn fired(&self) -> usize {
        self.fired
    }

    /// Number of faults still waiting to fire
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan() {
        let mut injector = FaultInjector::new(FaultPlan::new());
        assert!(!injector.take(KernelFault::FailThreadCreate));
        assert_eq!(injector.fired(), 0);
    }

    #[test]
    fn test_faults_fire_once() {
        let plan = FaultPlan::new()
            .with_fault(KernelFault::FailRcvAlias)
            .with_fault(KernelFault::FailRcvAlias);
        let mut injector = FaultInjector::new(plan);

        assert!(injector.take(KernelFault::FailRcvAlias));
        assert!(injector.take(KernelFault::FailRcvAlias));
        assert!(!injector.take(KernelFault::FailRcvAlias));
        assert_eq!(injector.fired(), 2);
    }

    #[test]
    fn test_unrelated_faults_stay_pending() {
        let plan = FaultPlan::new().with_fault(KernelFault::DiscontiguousAlias);
        let mut injector = FaultInjector::new(plan);

        assert!(!injector.take(KernelFault::FailAsndAlias));
        assert_eq!(injector.pending(), 1);
    }
}
