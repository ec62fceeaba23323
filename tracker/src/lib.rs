//! # Generation tracker
//!
//! A bounded cache of recent tree generations, each keyed by its
//! content [`Hash`](orchd_tree::Hash), with a patch from every cached
//! generation forward to the current latest. Lets an agent that last
//! acknowledged an older generation be brought up to date with a
//! single diff instead of a full snapshot, as long as that generation
//! hasn't aged out of the cache.
#![warn(missing_docs)]

use orchd_diff::{compose, diff, Patch};
use orchd_tree::{hash, Hash, Value};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Bounded, FIFO-evicted cache of tree generations. See the module
/// docs.
pub struct GenerationTracker {
    capacity: usize,
    latest: Value,
    latest_hash: Hash,
    /// Patch from a past generation's hash forward to `latest`. Does
    /// not contain an entry for `latest_hash` itself.
    forward: HashMap<Hash, Patch>,
    /// Insertion order of `forward`'s keys, oldest first, for eviction.
    order: VecDeque<Hash>,
}

impl GenerationTracker {
    /// Creates a tracker seeded with `initial` as the first latest
    /// generation. `capacity` bounds how many past generations remain
    /// reachable by a forward diff; it must be at least 1.
    pub fn new(capacity: usize, initial: Value) -> Self {
        assert!(capacity >= 1, "generation tracker capacity must be at least 1");
        let latest_hash = hash(&initial);
        Self {
            capacity,
            latest: initial,
            latest_hash,
            forward: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `value` as the new latest generation, unless it's
    /// already the latest (by content hash). Every previously tracked
    /// generation's forward patch is recomposed so it still reaches
    /// the new latest; the oldest generation is evicted if this would
    /// exceed capacity.
    pub fn insert_latest(&mut self, value: Value) {
        let new_hash = hash(&value);
        if new_hash == self.latest_hash {
            trace!(hash = %new_hash, "insert_latest: unchanged, no-op");
            return;
        }
        let forward_delta = diff(&self.latest, &value);
        for patch in self.forward.values_mut() {
            *patch = compose([std::mem::take(patch), forward_delta.clone()]);
        }
        self.forward.insert(self.latest_hash, forward_delta);
        self.order.push_back(self.latest_hash);
        self.latest = value;
        self.latest_hash = new_hash;

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.forward.remove(&evicted);
                trace!(hash = %evicted, "evicted generation past capacity");
            }
        }
    }

    /// The current latest generation.
    pub fn get_latest(&self) -> &Value {
        &self.latest
    }

    /// The current latest generation's content hash.
    pub fn get_latest_hash(&self) -> Hash {
        self.latest_hash
    }

    /// A patch from the generation identified by `h` to the latest
    /// generation, or `None` if `h` is not tracked (too old, or never
    /// seen). The empty patch is returned for `h == get_latest_hash()`.
    pub fn get_diff_from_hash_to_latest(&self, h: Hash) -> Option<Patch> {
        if h == self.latest_hash {
            return Some(Patch::empty());
        }
        self.forward.get(&h).cloned()
    }

    /// Number of past generations still reachable by a forward diff
    /// (not counting the latest itself).
    pub fn tracked_len(&self) -> usize {
        self.forward.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchd_diff::apply;
    use orchd_tree::Value;

    fn v(n: i64) -> Value {
        Value::record(vec![("generation", Value::leaf(n))])
    }

    #[test]
    fn get_latest_hash_matches_seeded_value() {
        let tracker = GenerationTracker::new(4, v(0));
        assert_eq!(tracker.get_latest_hash(), hash(&v(0)));
    }

    #[test]
    fn unchanged_insert_is_noop() {
        let mut tracker = GenerationTracker::new(4, v(0));
        let before = tracker.get_latest_hash();
        tracker.insert_latest(v(0));
        assert_eq!(tracker.get_latest_hash(), before);
        assert_eq!(tracker.tracked_len(), 0);
    }

    #[test]
    fn tracked_generation_diffs_forward_to_latest() {
        let mut tracker = GenerationTracker::new(4, v(0));
        let gen0_hash = tracker.get_latest_hash();
        tracker.insert_latest(v(1));
        tracker.insert_latest(v(2));

        let patch = tracker.get_diff_from_hash_to_latest(gen0_hash).unwrap();
        assert_eq!(apply(&v(0), &patch).unwrap(), v(2));
    }

    #[test]
    fn latest_hash_diffs_to_empty_patch() {
        let mut tracker = GenerationTracker::new(4, v(0));
        tracker.insert_latest(v(1));
        let patch = tracker
            .get_diff_from_hash_to_latest(tracker.get_latest_hash())
            .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn eviction_drops_oldest_generation_past_capacity() {
        let mut tracker = GenerationTracker::new(2, v(0));
        let gen0_hash = tracker.get_latest_hash();
        tracker.insert_latest(v(1));
        tracker.insert_latest(v(2));
        tracker.insert_latest(v(3));

        assert_eq!(tracker.tracked_len(), 2);
        assert!(tracker.get_diff_from_hash_to_latest(gen0_hash).is_none());
    }

    #[test]
    fn unknown_hash_returns_none() {
        let tracker = GenerationTracker::new(4, v(0));
        assert!(tracker
            .get_diff_from_hash_to_latest(hash(&v(999)))
            .is_none());
    }
}
