//! A fixed-capacity, open-addressing hash table from 64-bit keys to
//! main-tier record addresses.
//!
//! Readers run lock-free and concurrent with one writer: only the
//! garbage collector mutates a table, and it publishes a rebuilt
//! table wholesale, so writes are never contended. Two key values are
//! reserved as slot markers and surfaced to callers as constants.

use std::sync::atomic::{
    AtomicU64, AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::Key;

/// Marks a never-used slot. Keys with this value are rejected.
pub const EMPTY_KEY: Key = 0;

/// Marks a removed slot. Keys with this value are rejected.
pub const TOMBSTONE_KEY: Key = u64::MAX;

/// Whether callers may use `key` at all.
pub(crate) fn is_reserved(key: Key) -> bool {
    key == EMPTY_KEY || key == TOMBSTONE_KEY
}

struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

pub(crate) struct HashTable {
    slots: Box<[Slot]>,
    mask: usize,
    len: AtomicUsize,
}

// keys tend to be dense; one multiplicative mix spreads sequential
// keys across the table
fn mix(key: Key) -> usize {
    (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16) as usize
}

impl HashTable {
    pub(crate) fn new(capacity: usize) -> HashTable {
        let capacity = capacity.next_power_of_two().max(8);
        let slots = (0..capacity)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY_KEY),
                value: AtomicU64::new(0),
            })
            .collect();
        HashTable {
            slots,
            mask: capacity - 1,
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    /// Look up the main-tier address stored for `key`. `None` means
    /// the key has no main-tier record; it may still live in the
    /// insert log.
    pub(crate) fn get(&self, key: Key) -> Option<u64> {
        debug_assert!(!is_reserved(key));
        let mut i = mix(key);
        for _ in 0..=self.mask {
            let slot = &self.slots[i & self.mask];
            match slot.key.load(Acquire) {
                EMPTY_KEY => return None,
                k if k == key => return Some(slot.value.load(Acquire)),
                _ => i += 1,
            }
        }
        None
    }

    /// Map `key` to `value`, claiming an empty or tombstoned slot when
    /// the key is new. Returns `false` when the table is full. Callers
    /// must serialize writers.
    pub(crate) fn put(&self, key: Key, value: u64) -> bool {
        debug_assert!(!is_reserved(key));
        let mut i = mix(key);
        let mut reuse = None;
        for _ in 0..=self.mask {
            let slot = &self.slots[i & self.mask];
            match slot.key.load(Acquire) {
                k if k == key => {
                    slot.value.store(value, Release);
                    return true;
                }
                EMPTY_KEY => {
                    let slot = reuse.unwrap_or(slot);
                    slot.value.store(value, Release);
                    slot.key.store(key, Release);
                    self.len.fetch_add(1, Relaxed);
                    return true;
                }
                TOMBSTONE_KEY => {
                    if reuse.is_none() {
                        reuse = Some(slot);
                    }
                    i += 1;
                }
                _ => i += 1,
            }
        }
        // every slot probed; the key is not present, so only a
        // remembered tombstone can still take it
        if let Some(slot) = reuse {
            slot.value.store(value, Release);
            slot.key.store(key, Release);
            self.len.fetch_add(1, Relaxed);
            return true;
        }
        false
    }

    /// Drop the mapping for `key`, leaving a tombstone.
    pub(crate) fn remove(&self, key: Key) {
        debug_assert!(!is_reserved(key));
        let mut i = mix(key);
        for _ in 0..=self.mask {
            let slot = &self.slots[i & self.mask];
            match slot.key.load(Acquire) {
                EMPTY_KEY => return,
                k if k == key => {
                    slot.key.store(TOMBSTONE_KEY, Release);
                    self.len.fetch_sub(1, Relaxed);
                    return;
                }
                _ => i += 1,
            }
        }
    }
}
