//! Fixed-capacity handle pools
//!
//! Every capmgr object lives in a pool sized at image time. A slot goes
//! through three states: free, reserved (private to the allocating caller)
//! and active (visible to lookups). Handles carry a generation so a handle
//! to a freed-and-reused slot is detected instead of silently aliasing the
//! new occupant.
//!
//! ## Philosophy
//!
//! - **Reserve, then publish**: `allocate` returns a [`Reservation`]. If the
//!   caller drops it without calling [`Reservation::activate`], the slot goes
//!   back to the pool. Half-built objects never become visible.
//! - **Exhaustion is ordinary**: a full pool is a [`PoolError`], not a panic.
//! - **Indices start at 1**: index `0` is the failure sentinel clients see,
//!   so a pool of capacity `N` hands out indices `1..=N`.
//!
//! ## Example
//!
//! ```
//! use services_capability_manager::pool::HandlePool;
//!
//! let pool: HandlePool<&str> = HandlePool::new("example", 2);
//! let pending = pool.allocate().unwrap();
//! let handle = pending.activate("hello");
//!
//! assert_eq!(pool.get(handle), Some("hello"));
//! assert_eq!(handle.index(), 1);
//! ```

use crate::error::PoolError;
use spin::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A generation-checked reference to an active pool slot
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index; this is the id clients see
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}@{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Free,
    Reserved,
    Active(T),
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

struct PoolInner<T> {
    /// `entries[0]` is never used
    entries: Vec<Entry<T>>,
    /// No free slot below this index
    low_water: usize,
    active: usize,
}

impl<T> PoolInner<T> {
    fn is_free(&self, index: usize) -> bool {
        matches!(self.entries[index].slot, Slot::Free)
    }

    fn release(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.slot = Slot::Free;
        entry.generation = entry.generation.wrapping_add(1);
        if index < self.low_water {
            self.low_water = index;
        }
    }
}

/// A fixed-capacity pool of `T`
pub struct HandlePool<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
}

impl<T> HandlePool<T> {
    /// Creates a pool with slots `1..=capacity`
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let entries = (0..=capacity)
            .map(|_| Entry {
                generation: 0,
                slot: Slot::Free,
            })
            .collect();
        Self {
            name,
            capacity,
            inner: Mutex::new(PoolInner {
                entries,
                low_water: 1,
                active: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of published objects
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    fn exhausted(&self) -> PoolError {
        PoolError::Exhausted { pool: self.name }
    }

    fn reserve(&self, inner: &mut PoolInner<T>, index: usize) -> Reservation<'_, T> {
        inner.entries[index].slot = Slot::Reserved;
        Reservation {
            pool: self,
            index: index as u32,
            generation: inner.entries[index].generation,
            armed: true,
        }
    }

    /// Reserves the lowest free slot
    pub fn allocate(&self) -> Result<Reservation<'_, T>, PoolError> {
        let mut inner = self.inner.lock();
        let start = inner.low_water;
        let index = (start..=self.capacity)
            .find(|i| inner.is_free(*i))
            .ok_or_else(|| self.exhausted())?;
        inner.low_water = index + 1;
        Ok(self.reserve(&mut inner, index))
    }

    /// Reserves `count` consecutive slots in one step
    ///
    /// Concurrent callers never receive interleaved runs.
    pub fn allocate_run(&self, count: usize) -> Result<Vec<Reservation<'_, T>>, PoolError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // Also keeps `start + count` below overflow for client-sized counts
        if count > self.capacity {
            return Err(self.exhausted());
        }
        let mut inner = self.inner.lock();
        let mut start = inner.low_water;
        while start + count - 1 <= self.capacity {
            match (start..start + count).find(|i| !inner.is_free(*i)) {
                // Skip past the occupied slot
                Some(busy) => start = busy + 1,
                None => {
                    if start == inner.low_water {
                        inner.low_water = start + count;
                    }
                    return Ok((start..start + count)
                        .map(|i| self.reserve(&mut inner, i))
                        .collect());
                }
            }
        }
        Err(self.exhausted())
    }

    /// Reserves the slot at a caller-chosen index
    pub fn allocate_at(&self, index: u32) -> Result<Reservation<'_, T>, PoolError> {
        let i = index as usize;
        if i == 0 || i > self.capacity {
            return Err(PoolError::OutOfRange {
                pool: self.name,
                index,
            });
        }
        let mut inner = self.inner.lock();
        if !inner.is_free(i) {
            return Err(PoolError::Occupied {
                pool: self.name,
                index,
            });
        }
        Ok(self.reserve(&mut inner, i))
    }

    /// Revokes an active slot and returns its object
    pub fn free(&self, handle: Handle<T>) -> Result<T, PoolError> {
        let mut inner = self.inner.lock();
        let i = handle.index as usize;
        let stale = PoolError::Stale {
            pool: self.name,
            index: handle.index,
        };
        let entry = inner.entries.get_mut(i).ok_or(stale)?;
        if entry.generation != handle.generation || !matches!(entry.slot, Slot::Active(_)) {
            return Err(stale);
        }
        match std::mem::replace(&mut entry.slot, Slot::Reserved) {
            Slot::Active(value) => {
                inner.active -= 1;
                inner.release(i);
                Ok(value)
            }
            _ => Err(stale),
        }
    }

    /// Runs `f` on an active object
    pub fn with<R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        match inner.entries.get(handle.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Active(value),
            }) if *generation == handle.generation => Some(f(value)),
            _ => None,
        }
    }

    /// Runs `f` on an active object, mutably
    pub fn with_mut<R>(&self, handle: Handle<T>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(handle.index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Active(value),
            }) if *generation == handle.generation => Some(f(value)),
            _ => None,
        }
    }

    /// Handle of the active object at `index`, if any
    pub fn handle_at(&self, index: u32) -> Option<Handle<T>> {
        let inner = self.inner.lock();
        match inner.entries.get(index as usize) {
            Some(Entry {
                generation,
                slot: Slot::Active(_),
            }) if index != 0 => Some(Handle::new(index, *generation)),
            _ => None,
        }
    }

    /// First active object matching `pred`, scanning from index 1
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle<T>> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, entry)| match &entry.slot {
                Slot::Active(value) if pred(value) => Some(Handle::new(i as u32, entry.generation)),
                _ => None,
            })
    }

    fn publish(&self, index: u32, generation: u32, value: T) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[index as usize];
        debug_assert!(matches!(entry.slot, Slot::Reserved));
        debug_assert_eq!(entry.generation, generation);
        entry.slot = Slot::Active(value);
        inner.active += 1;
    }

    fn unreserve(&self, index: u32) {
        let mut inner = self.inner.lock();
        if matches!(inner.entries[index as usize].slot, Slot::Reserved) {
            inner.release(index as usize);
        }
    }
}

impl<T: Clone> HandlePool<T> {
    /// Copy of an active object
    pub fn get(&self, handle: Handle<T>) -> Option<T> {
        self.with(handle, T::clone)
    }
}

/// A reserved slot, not yet visible to lookups
///
/// Dropping it returns the slot to the pool.
#[must_use = "a reservation is freed when dropped"]
pub struct Reservation<'a, T> {
    pool: &'a HandlePool<T>,
    index: u32,
    generation: u32,
    armed: bool,
}

impl<'a, T> Reservation<'a, T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The handle this slot will have once activated
    pub fn handle(&self) -> Handle<T> {
        Handle::new(self.index, self.generation)
    }

    /// Publishes `value` in the reserved slot
    pub fn activate(mut self, value: T) -> Handle<T> {
        self.armed = false;
        self.pool.publish(self.index, self.generation, value);
        self.handle()
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.unreserve(self.index);
        }
    }
}

impl<T> fmt::Debug for Reservation<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_capacity_bound() {
        let pool: HandlePool<u32> = HandlePool::new("thd", 3);
        let handles: Vec<_> = (0..3)
            .map(|i| pool.allocate().unwrap().activate(i))
            .collect();

        assert_eq!(
            pool.allocate().unwrap_err(),
            PoolError::Exhausted { pool: "thd" }
        );

        pool.free(handles[1]).unwrap();
        let again = pool.allocate().unwrap().activate(9);
        assert_eq!(again.index(), 2);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_index_zero_never_used() {
        let pool: HandlePool<u32> = HandlePool::new("comp", 4);
        let handle = pool.allocate().unwrap().activate(1);
        assert_eq!(handle.index(), 1);
        assert!(pool.handle_at(0).is_none());
        assert!(matches!(
            pool.allocate_at(0),
            Err(PoolError::OutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn test_reservation_invisible_until_activated() {
        let pool: HandlePool<u32> = HandlePool::new("rcv", 2);
        let pending = pool.allocate().unwrap();
        let handle = pending.handle();

        assert_eq!(pool.get(handle), None);
        assert_eq!(pool.active_count(), 0);

        pending.activate(5);
        assert_eq!(pool.get(handle), Some(5));
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_dropped_reservation_frees_slot() {
        let pool: HandlePool<u32> = HandlePool::new("asnd", 1);
        {
            let _pending = pool.allocate().unwrap();
            assert!(pool.allocate().is_err());
        }
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_stale_handle_detected() {
        let pool: HandlePool<u32> = HandlePool::new("span", 1);
        let old = pool.allocate().unwrap().activate(1);
        pool.free(old).unwrap();
        let new = pool.allocate().unwrap().activate(2);

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(pool.get(old), None);
        assert!(matches!(pool.free(old), Err(PoolError::Stale { .. })));
        assert_eq!(pool.get(new), Some(2));
    }

    #[test]
    fn test_allocate_run_is_consecutive() {
        let pool: HandlePool<u32> = HandlePool::new("page", 10);
        let single = pool.allocate().unwrap().activate(0);
        let run = pool.allocate_run(4).unwrap();
        let indices: Vec<u32> = run.iter().map(Reservation::index).collect();
        assert_eq!(indices, vec![2, 3, 4, 5]);

        drop(run);
        pool.free(single).unwrap();
        assert_eq!(pool.allocate_run(10).unwrap().len(), 10);
    }

    #[test]
    fn test_allocate_run_skips_holes() {
        let pool: HandlePool<u32> = HandlePool::new("page", 6);
        let handles: Vec<_> = (0..6)
            .map(|i| pool.allocate().unwrap().activate(i))
            .collect();
        // Free 2 and 4..=6; only 4..=6 fits a run of three
        pool.free(handles[1]).unwrap();
        for handle in &handles[3..] {
            pool.free(*handle).unwrap();
        }

        let run = pool.allocate_run(3).unwrap();
        assert_eq!(run[0].index(), 4);
        assert!(pool.allocate_run(2).is_err());
        assert_eq!(pool.allocate().unwrap().index(), 2);
    }

    #[test]
    fn test_allocate_run_longer_than_pool() {
        let pool: HandlePool<u32> = HandlePool::new("page", 8);
        let exhausted = PoolError::Exhausted { pool: "page" };
        assert_eq!(pool.allocate_run(9).unwrap_err(), exhausted);
        assert_eq!(pool.allocate_run(usize::MAX).unwrap_err(), exhausted);

        let _first = pool.allocate().unwrap();
        assert_eq!(pool.allocate_run(usize::MAX - 1).unwrap_err(), exhausted);
        assert_eq!(pool.allocate_run(7).unwrap().len(), 7);
    }

    #[test]
    fn test_allocate_at() {
        let pool: HandlePool<u32> = HandlePool::new("comp", 8);
        let handle = pool.allocate_at(5).unwrap().activate(50);
        assert_eq!(handle.index(), 5);
        assert!(matches!(
            pool.allocate_at(5),
            Err(PoolError::Occupied { index: 5, .. })
        ));
        assert!(matches!(
            pool.allocate_at(9),
            Err(PoolError::OutOfRange { index: 9, .. })
        ));
        // Lowest-free allocation is unaffected by the explicit slot
        assert_eq!(pool.allocate().unwrap().index(), 1);
    }

    #[test]
    fn test_find_and_with_mut() {
        let pool: HandlePool<(u32, &str)> = HandlePool::new("thd", 4);
        pool.allocate().unwrap().activate((7, "a"));
        let b = pool.allocate().unwrap().activate((8, "b"));

        assert_eq!(pool.find(|(tid, _)| *tid == 8), Some(b));
        assert_eq!(pool.find(|(tid, _)| *tid == 9), None);

        pool.with_mut(b, |entry| entry.1 = "c");
        assert_eq!(pool.get(b), Some((8, "c")));
    }

    proptest! {
        #[test]
        fn allocations_are_distinct_and_bounded(capacity in 1usize..48) {
            let pool: HandlePool<usize> = HandlePool::new("prop", capacity);
            let mut seen = HashSet::new();
            for i in 0..capacity {
                let handle = pool.allocate().unwrap().activate(i);
                prop_assert!(handle.index() >= 1 && handle.index() as usize <= capacity);
                prop_assert!(seen.insert(handle.index()));
            }
            prop_assert!(pool.allocate().is_err());
        }

        #[test]
        fn free_makes_exactly_one_slot(capacity in 1usize..32, victim in 0usize..32) {
            let pool: HandlePool<usize> = HandlePool::new("prop", capacity);
            let handles: Vec<_> = (0..capacity)
                .map(|i| pool.allocate().unwrap().activate(i))
                .collect();
            let victim = handles[victim % capacity];
            pool.free(victim).unwrap();

            let reused = pool.allocate().unwrap().activate(0);
            prop_assert_eq!(reused.index(), victim.index());
            prop_assert!(pool.allocate().is_err());
        }

        #[test]
        fn runs_never_overlap(sizes in proptest::collection::vec(1usize..6, 1..8)) {
            let pool: HandlePool<usize> = HandlePool::new("prop", 64);
            let mut taken = HashSet::new();
            let mut held = Vec::new();
            for size in sizes {
                let run = pool.allocate_run(size).unwrap();
                let first = run[0].index();
                for (offset, reservation) in run.iter().enumerate() {
                    prop_assert_eq!(reservation.index(), first + offset as u32);
                    prop_assert!(taken.insert(reservation.index()));
                }
                held.push(run);
            }
        }
    }
}
