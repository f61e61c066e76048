//! Concurrent cache with expire-after-access TTL and LRU eviction.
//!
//! Backed by a `DashMap`, so operations on one key are atomic with respect to
//! each other (the shard lock is held while a closure runs). Entries for which
//! the optional pin predicate returns `true` are never expired or evicted; the
//! quota manager pins entries that still carry un-synchronized diffs.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    accessed_at: Instant,
}

impl<V> Slot<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            accessed_at: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.accessed_at = Instant::now();
    }
}

/// Size- and time-bounded concurrent map.
pub struct BoundedCache<K, V> {
    slots: DashMap<K, Slot<V>>,
    ttl: Duration,
    max_entries: usize,
    pin: Option<fn(&V) -> bool>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `max_entries` is clamped to a minimum of 1.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            pin: None,
        }
    }

    /// Like [`BoundedCache::new`], but entries matching `pin` are retained
    /// regardless of age or capacity.
    pub fn with_pin(ttl: Duration, max_entries: usize, pin: fn(&V) -> bool) -> Self {
        Self {
            pin: Some(pin),
            ..Self::new(ttl, max_entries)
        }
    }

    /// Current value, refreshing its access time. Expired entries are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        self.compute_if_present(key, |value| value.clone())
    }

    /// Current value without refreshing its access time.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.slots
            .get(key)
            .filter(|slot| !self.is_stale(slot))
            .map(|slot| slot.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Existing live value, or `init()` inserted if absent (or expired).
    pub fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V {
        let value = match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                if self.is_stale(occupied.get()) {
                    occupied.insert(Slot::new(init()));
                } else {
                    occupied.get_mut().touch();
                }
                occupied.get().value.clone()
            }
            Entry::Vacant(vacant) => vacant.insert(Slot::new(init())).value.clone(),
        };
        self.enforce_capacity();
        value
    }

    /// Insert or replace, returning the previous live value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let previous = self
            .slots
            .insert(key, Slot::new(value))
            .filter(|slot| !self.is_stale(slot))
            .map(|slot| slot.value);
        self.enforce_capacity();
        previous
    }

    /// Run `f` on the live value under the entry lock. `None` if absent.
    pub fn compute_if_present<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let stale = {
            let mut slot = self.slots.get_mut(key)?;
            if !self.is_stale(&slot) {
                slot.touch();
                return Some(f(&mut slot.value));
            }
            true
        };
        if stale {
            self.slots.remove_if(key, |_, slot| self.is_stale(slot));
        }
        None
    }

    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.slots.remove(key).map(|(_, slot)| slot.value)
    }

    /// Replace every live value with `f(old)`, returning the old values.
    ///
    /// Each key is swapped under its own entry lock; concurrent updates to a
    /// key land either before (and are captured) or after (and are kept).
    /// Access times are left untouched.
    pub fn replace_all(&self, mut f: impl FnMut(&K, &V) -> V) -> Vec<(K, V)> {
        self.evict_expired();
        let mut captured = Vec::with_capacity(self.slots.len());
        for mut slot in self.slots.iter_mut() {
            let (key, slot) = slot.pair_mut();
            let replacement = f(key, &slot.value);
            let old = std::mem::replace(&mut slot.value, replacement);
            captured.push((key.clone(), old));
        }
        captured
    }

    /// Drop every expired, unpinned entry. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !self.is_stale(slot));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    // -- private helpers ---------------------------------------------------

    fn is_pinned(&self, value: &V) -> bool {
        self.pin.is_some_and(|pin| pin(value))
    }

    fn is_stale(&self, slot: &Slot<V>) -> bool {
        slot.accessed_at.elapsed() > self.ttl && !self.is_pinned(&slot.value)
    }

    fn enforce_capacity(&self) {
        if self.slots.len() <= self.max_entries {
            return;
        }
        self.evict_expired();
        while self.slots.len() > self.max_entries {
            let lru = self
                .slots
                .iter()
                .filter(|slot| !self.is_pinned(&slot.value))
                .min_by_key(|slot| slot.accessed_at)
                .map(|slot| slot.key().clone());
            match lru {
                Some(key) => {
                    debug!("Evicting least recently used cache entry");
                    self.slots.remove(&key);
                }
                // Everything left is pinned.
                None => break,
            }
        }
    }
}
