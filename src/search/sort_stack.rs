//! Bounded rank-ordered stack.
//!
//! Entries are keyed by a computed rank (higher is better). Key collisions
//! are resolved by probing to the next free lower key, which preserves
//! insertion order among equal ranks. At capacity, a new entry either
//! evicts the current worst or is dropped, whichever ranks better.

use std::collections::BTreeMap;

/// Bounded map from rank key to entry, best-first extraction.
#[derive(Debug)]
pub struct SortStack<T> {
    entries: BTreeMap<u64, T>,
    max_entries: usize,
}

impl<T> SortStack<T> {
    /// Create a stack holding at most `max_entries` entries. A bound of
    /// zero keeps nothing.
    pub fn new(max_entries: usize) -> Self {
        SortStack {
            entries: BTreeMap::new(),
            max_entries,
        }
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry under a rank key. When the key is taken, probe down
    /// to the next free key. When full and the entry ranks below the
    /// current worst, it is dropped; otherwise the worst is evicted.
    /// Returns true if the entry was kept.
    pub fn push(&mut self, rank: u64, entry: T) -> bool {
        if self.max_entries == 0 {
            return false;
        }
        if self.entries.len() >= self.max_entries {
            let worst = *self.entries.keys().next().unwrap();
            if rank <= worst {
                return false;
            }
            self.entries.remove(&worst);
        }
        let mut key = rank;
        while self.entries.contains_key(&key) {
            if key == 0 {
                return false;
            }
            key -= 1;
        }
        self.entries.insert(key, entry);
        true
    }

    /// Remove and return the best entry with its effective rank key.
    pub fn pop_best(&mut self) -> Option<(u64, T)> {
        let key = *self.entries.keys().next_back()?;
        self.entries.remove(&key).map(|e| (key, e))
    }

    /// Rank key of the current best entry.
    pub fn best_rank(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    /// Rank key of the current worst entry.
    pub fn worst_rank(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_best_is_non_increasing() {
        let mut stack = SortStack::new(10);
        for (rank, name) in [(5u64, "e"), (9, "a"), (7, "c"), (1, "g")] {
            assert!(stack.push(rank, name));
        }
        let mut last = u64::MAX;
        while let Some((rank, _)) = stack.pop_best() {
            assert!(rank <= last);
            last = rank;
        }
    }

    #[test]
    fn test_capacity_evicts_worst() {
        let mut stack = SortStack::new(2);
        assert!(stack.push(5, "a"));
        assert!(stack.push(3, "b"));
        // ranks below the worst are dropped
        assert!(!stack.push(2, "c"));
        assert_eq!(stack.len(), 2);
        // a better rank evicts the worst
        assert!(stack.push(9, "d"));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.worst_rank(), Some(5));
    }

    #[test]
    fn test_collision_probes_to_next_key() {
        let mut stack = SortStack::new(10);
        assert!(stack.push(5, "first"));
        assert!(stack.push(5, "second"));
        assert_eq!(stack.len(), 2);
        // the first insert keeps the higher key
        assert_eq!(stack.pop_best().unwrap().1, "first");
        assert_eq!(stack.pop_best().unwrap().1, "second");
    }
}
