//! Opaque handles.
//!
//! The original C ABI hands the front-end raw `void*` device/request
//! pointers. This crate backs them with `slab::Slab` indices instead: a
//! generation tag rides along with each handle so that a handle from a
//! `deinit`'d device (whose slot may since have been reused by a new
//! device) is rejected rather than silently resolving to the wrong entry.

use std::collections::HashMap;
use std::sync::Mutex;

use slab::Slab;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    index: usize,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: T,
}

/// A generation-checked slab registry, generic over what it stores
/// (`DeviceState` for [`DeviceHandle`], an `AbortHandle` for [`RequestHandle`]).
pub struct Registry<T> {
    slab: Mutex<Slab<Slot<T>>>,
    // Next generation to hand out for each slab index, so that when an
    // index is reused after a remove(), the new occupant's handles compare
    // unequal to any handle still referring to the old one.
    next_generation: Mutex<HashMap<usize, u32>>,
}

impl<T> Registry<T> {
    pub fn new() -> Registry<T> {
        Registry {
            slab: Mutex::new(Slab::new()),
            next_generation: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> (usize, u32) {
        let mut slab = self.slab.lock().unwrap();
        let index = slab.vacant_key();
        let mut next_gen = self.next_generation.lock().unwrap();
        let generation = next_gen.entry(index).or_insert(0);
        let this_gen = *generation;
        *generation += 1;
        let inserted = slab.insert(Slot {
            generation: this_gen,
            value,
        });
        debug_assert_eq!(inserted, index);
        (index, this_gen)
    }

    pub fn get<R>(&self, index: usize, generation: u32, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slab = self.slab.lock().unwrap();
        slab.get(index)
            .filter(|slot| slot.generation == generation)
            .map(|slot| f(&slot.value))
    }

    pub fn remove(&self, index: usize, generation: u32) -> Option<T> {
        let mut slab = self.slab.lock().unwrap();
        if slab.get(index).map(|s| s.generation) != Some(generation) {
            return None;
        }
        Some(slab.remove(index).value)
    }

    pub fn with_mut<R>(&self, index: usize, generation: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slab = self.slab.lock().unwrap();
        slab.get_mut(index)
            .filter(|slot| slot.generation == generation)
            .map(|slot| f(&mut slot.value))
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry::new()
    }
}

impl DeviceHandle {
    pub(crate) fn new(index: usize, generation: u32) -> DeviceHandle {
        DeviceHandle { index, generation }
    }
    pub(crate) fn index(&self) -> usize {
        self.index
    }
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl RequestHandle {
    pub(crate) fn new(index: usize, generation: u32) -> RequestHandle {
        RequestHandle { index, generation }
    }
    pub(crate) fn index(&self) -> usize {
        self.index
    }
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_after_removal_is_rejected() {
        let reg: Registry<u32> = Registry::new();
        let (idx, gen) = reg.insert(42);
        let handle = DeviceHandle::new(idx, gen);

        assert_eq!(reg.get(handle.index(), handle.generation(), |v| *v), Some(42));
        reg.remove(handle.index(), handle.generation());
        assert_eq!(reg.get(handle.index(), handle.generation(), |v| *v), None);

        // A new insertion may reuse the slot index, but with a fresh
        // generation, so the old handle still must not resolve to it.
        let (idx2, gen2) = reg.insert(99);
        if idx2 == handle.index() {
            assert_ne!(gen2, handle.generation(), "generation must differ on reuse");
        }
    }
}
