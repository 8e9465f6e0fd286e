//! Fixed-size slot arenas addressed by `(generation, index)` handles, per
//! spec.md §9: "unsafe pointer-heavy object layout maps to explicit arenas
//! ... handles are arena-local 64-bit (generation + index) values; a handle
//! with the wrong generation is a logical null." Used both for object
//! version-chain nodes and for string/blob side-store entries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// A handle into an `Arena<T>`. Packs a 32-bit generation and a 32-bit slot
/// index; `NULL` is reserved as "no handle" (index `u32::MAX`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const NULL: Handle = Handle {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A growable arena with a free list; slots are recycled, never shrunk, so
/// handles into live data remain valid for the arena's lifetime.
pub struct Arena<T> {
    slots: Mutex<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
    len: AtomicU32,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            len: AtomicU32::new(0),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            free: Mutex::new(Vec::new()),
            len: AtomicU32::new(0),
        }
    }

    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, value: T) -> Handle {
        self.len.fetch_add(1, Ordering::AcqRel);
        if let Some(index) = self.free.lock().unwrap().pop() {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }

        let mut slots = self.slots.lock().unwrap();
        let index = slots.len() as u32;
        slots.push(Slot {
            value: Some(value),
            generation: 1,
        });
        Handle { index, generation: 1 }
    }

    /// Removes the value behind `handle`, bumping the slot's generation so
    /// stale copies of this handle fail future lookups. No-op (returns
    /// `None`) if the handle is already stale or null.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        if handle.is_null() {
            return None;
        }
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        drop(slots);
        if value.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            self.free.lock().unwrap().push(handle.index);
        }
        value
    }

    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        if handle.is_null() {
            return None;
        }
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref().map(f)
    }

    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if handle.is_null() {
            return None;
        }
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut().map(f)
    }

    /// Snapshot of all live `(handle, clone-of-value)` pairs, for scans.
    pub fn snapshot(&self) -> Vec<(Handle, T)>
    where
        T: Clone,
    {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.value.clone().map(|v| {
                    (
                        Handle {
                            index: index as u32,
                            generation: slot.generation,
                        },
                        v,
                    )
                })
            })
            .collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let arena = Arena::new();
        let h = arena.insert(42);
        assert_eq!(arena.with(h, |v| *v), Some(42));
    }

    #[test]
    fn stale_handle_after_remove() {
        let arena: Arena<i32> = Arena::new();
        let h = arena.insert(1);
        arena.remove(h);
        assert_eq!(arena.with(h, |v| *v), None);
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let arena: Arena<i32> = Arena::new();
        let h1 = arena.insert(1);
        arena.remove(h1);
        let h2 = arena.insert(2);
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1, h2);
        assert_eq!(arena.with(h2, |v| *v), Some(2));
    }
}
