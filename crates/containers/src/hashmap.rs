use alloc::alloc::Global;
use core::alloc::Allocator;
use core::hash::{Hash, Hasher};

use crate::{over_load_factor, KVec};
use crate::hash::KernelHasher;

enum Slot<K, V> {
    Empty,
    Tombstone,
    Occupied(K, V),
}

/// An open-addressed hash map using linear probing and tombstones for
/// deletion, generic over an [`Allocator`].
///
/// Occupied slots are probed linearly from `hash % capacity`. A removed
/// slot becomes a [`Slot::Tombstone`] rather than [`Slot::Empty`] so that
/// probe chains past it stay intact; tombstones are reclaimed on the next
/// grow. Capacity is always a power of two so that `hash % capacity` is a
/// mask operation.
pub struct KHashMap<K, V, A: Allocator = Global> {
    slots: KVec<Slot<K, V>, A>,
    len: usize,
    tombstones: usize,
}

const INITIAL_CAPACITY: usize = 16;

impl<K: Eq + Hash, V> KHashMap<K, V> {
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl<K: Eq + Hash, V> Default for KHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V, A: Allocator + Clone> KHashMap<K, V, A> {
    pub fn new_in(alloc: A) -> Self {
        let mut slots = KVec::new_in(alloc);
        slots.resize_with(INITIAL_CAPACITY, || Slot::Empty);
        Self {
            slots,
            len: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = KernelHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Finds either the slot occupied by `key`, or the first slot (empty
    /// or tombstone) where it could be inserted. Returns `(index,
    /// already_present)`.
    fn probe(&self, key: &K) -> (usize, bool) {
        let capacity = self.capacity();
        let mask = capacity - 1;
        let mut index = (Self::hash_of(key) as usize) & mask;
        let mut first_tombstone = None;

        for _ in 0..capacity {
            match &self.slots[index] {
                Slot::Empty => {
                    return (first_tombstone.unwrap_or(index), false);
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) if k == key => return (index, true),
                Slot::Occupied(..) => {}
            }
            index = (index + 1) & mask;
        }

        (first_tombstone.unwrap_or(index), false)
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity() * 2;
        let alloc = self.slots.allocator().clone();
        let mut old = KVec::new_in(alloc);
        old.resize_with(new_capacity, || Slot::Empty);
        core::mem::swap(&mut self.slots, &mut old);

        self.len = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                self.insert(k, v);
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if over_load_factor(self.len + self.tombstones + 1, self.capacity()) {
            self.grow();
        }

        let (index, present) = self.probe(&key);
        let prior_tombstone = matches!(self.slots[index], Slot::Tombstone);
        let old = core::mem::replace(&mut self.slots[index], Slot::Occupied(key, value));

        if present {
            match old {
                Slot::Occupied(_, v) => Some(v),
                _ => unreachable!(),
            }
        } else {
            self.len += 1;
            if prior_tombstone {
                self.tombstones -= 1;
            }
            None
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let (index, present) = self.probe(key);
        if !present {
            return None;
        }
        match &self.slots[index] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let (index, present) = self.probe(key);
        if !present {
            return None;
        }
        match &mut self.slots[index] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.probe(key).1
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (index, present) = self.probe(key);
        if !present {
            return None;
        }
        let old = core::mem::replace(&mut self.slots[index], Slot::Tombstone);
        self.len -= 1;
        self.tombstones += 1;
        match old {
            Slot::Occupied(_, v) => Some(v),
            _ => unreachable!(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        })
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut map: KHashMap<u32, u32> = KHashMap::new();
        for i in 0..40 {
            assert_eq!(map.insert(i, i * 2), None);
        }
        assert_eq!(map.len(), 40);
        for i in 0..40 {
            assert_eq!(map.get(&i), Some(&(i * 2)));
        }
        for i in 0..20 {
            assert_eq!(map.remove(&i), Some(i * 2));
        }
        assert_eq!(map.len(), 20);
        for i in 0..20 {
            assert_eq!(map.get(&i), None);
        }
        for i in 20..40 {
            assert_eq!(map.get(&i), Some(&(i * 2)));
        }
    }

    #[test]
    fn tombstones_do_not_break_probe_chains() {
        let mut map: KHashMap<u32, u32> = KHashMap::new();
        map.insert(1, 1);
        map.insert(2, 2);
        map.insert(3, 3);
        map.remove(&2);
        assert_eq!(map.get(&1), Some(&1));
        assert_eq!(map.get(&3), Some(&3));
        assert_eq!(map.get(&2), None);

        map.insert(2, 99);
        assert_eq!(map.get(&2), Some(&99));
    }

    #[test]
    fn reinsert_after_remove_updates_value() {
        let mut map: KHashMap<&'static str, u32> = KHashMap::new();
        map.insert("a", 1);
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(&2));
        assert_eq!(map.len(), 1);
    }
}
