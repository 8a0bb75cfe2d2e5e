use alloc::alloc::Global;
use core::alloc::Allocator;
use core::hash::Hash;

use crate::{KHashMap, KVec};

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// A fixed-capacity LRU cache keyed on a fingerprint (an LBA, an inode
/// number, a block-group number), with eviction driven by an explicit
/// callback rather than a stored back-reference to whatever owns the
/// cache.
///
/// The source this is modeled on stores a pointer from each cache entry
/// back to its owning port so eviction can write the entry back; that is
/// exactly the cyclic-owning-graph pattern the design notes forbid.
/// Here, eviction hands the evicted `(K, V)` to a caller-supplied closure
/// at the moment of eviction, so the caller's own borrow of the backing
/// device supplies whatever context the original back-pointer would
/// have. No entry is ever destroyed without that closure seeing it
/// first, matching "eviction of a dirty entry issues a write... before
/// the entry memory is released".
///
/// Recency order is an intrusive doubly linked list over a slab of slots
/// (indices, not pointers, so the whole structure stays safe code); a
/// parallel [`KHashMap`] resolves a key to its slot.
pub struct LruCache<K, V, A: Allocator = Global> {
    capacity: usize,
    slots: KVec<Option<Node<K, V>>, A>,
    free: KVec<usize, A>,
    index: KHashMap<K, usize, A>,
    head: usize,
    tail: usize,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self::new_in(capacity, Global)
    }
}

impl<K: Clone + Eq + Hash, V, A: Allocator + Clone> LruCache<K, V, A> {
    pub fn new_in(capacity: usize, alloc: A) -> Self {
        assert!(capacity > 0, "LRU cache capacity must be nonzero");
        Self {
            capacity,
            slots: KVec::new_in(alloc.clone()),
            free: KVec::new_in(alloc.clone()),
            index: KHashMap::new_in(alloc),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.slots[slot].as_ref().unwrap();
            (node.prev, node.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.slots[slot].as_mut().unwrap();
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().unwrap().prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    fn touch(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(slot) = self.free.pop() {
            slot
        } else {
            self.slots.push(None);
            self.slots.len() - 1
        }
    }

    /// Inserts `key -> value`. If the cache is at capacity and `key` is
    /// not already present, the least-recently-used entry is evicted and
    /// handed to `on_evict` before the new entry is stored. Returns the
    /// previous value for `key`, if any (no eviction occurs in that
    /// case — it's a replacement, not a new entry).
    pub fn insert(&mut self, key: K, value: V, on_evict: impl FnOnce(K, V)) -> Option<V> {
        if let Some(&slot) = self.index.get(&key) {
            self.touch(slot);
            return Some(core::mem::replace(
                &mut self.slots[slot].as_mut().unwrap().value,
                value,
            ));
        }

        if self.len() >= self.capacity {
            self.evict_one(on_evict);
        }

        let slot = self.alloc_slot();
        self.slots[slot] = Some(Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        });
        self.push_front(slot);
        self.index.insert(key, slot);
        None
    }

    fn evict_one(&mut self, on_evict: impl FnOnce(K, V)) {
        let tail = self.tail;
        if tail == NIL {
            return;
        }
        self.unlink(tail);
        let node = self.slots[tail].take().unwrap();
        self.free.push(tail);
        self.index.remove(&node.key);
        on_evict(node.key, node.value);
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(&mut self.slots[slot].as_mut().unwrap().value)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        Some(&self.slots[slot].as_ref().unwrap().value)
    }

    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        Some(&mut self.slots[slot].as_mut().unwrap().value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        let node = self.slots[slot].take().unwrap();
        self.free.push(slot);
        Some(node.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Evicts every entry through `on_evict`, most-recently-used last,
    /// leaving the cache empty. Used for an explicit `flush()`.
    pub fn drain(&mut self, mut on_evict: impl FnMut(K, V)) {
        while self.tail != NIL {
            let tail = self.tail;
            self.unlink(tail);
            let node = self.slots[tail].take().unwrap();
            self.free.push(tail);
            self.index.remove(&node.key);
            on_evict(node.key, node.value);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots.iter_mut().filter_map(|slot| {
            slot.as_mut().map(|node| (&node.key, &mut node.value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn evicts_least_recently_used() {
        let mut evicted = Vec::new();
        let mut cache: LruCache<u32, u32> = LruCache::new(2);

        cache.insert(1, 10, |k, v| evicted.push((k, v)));
        cache.insert(2, 20, |k, v| evicted.push((k, v)));
        // Touch 1 so 2 becomes the LRU entry.
        assert_eq!(cache.get_mut(&1), Some(&mut 10));
        cache.insert(3, 30, |k, v| evicted.push((k, v)));

        assert_eq!(evicted, alloc::vec![(2, 20)]);
        assert_eq!(cache.peek(&1), Some(&10));
        assert_eq!(cache.peek(&2), None);
        assert_eq!(cache.peek(&3), Some(&30));
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let mut evicted = Vec::new();
        let mut cache: LruCache<u32, u32> = LruCache::new(1);
        cache.insert(1, 10, |k, v| evicted.push((k, v)));
        let prior = cache.insert(1, 11, |k, v| evicted.push((k, v)));
        assert_eq!(prior, Some(10));
        assert!(evicted.is_empty());
        assert_eq!(cache.peek(&1), Some(&11));
    }

    #[test]
    fn drain_visits_every_entry() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4);
        cache.insert(1, 10, |_, _| {});
        cache.insert(2, 20, |_, _| {});
        cache.insert(3, 30, |_, _| {});

        let mut seen = Vec::new();
        cache.drain(|k, v| seen.push((k, v)));
        seen.sort();
        assert_eq!(seen, alloc::vec![(1, 10), (2, 20), (3, 30)]);
        assert!(cache.is_empty());
    }
}
