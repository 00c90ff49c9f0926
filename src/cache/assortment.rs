//! The assortment cluster: the bounded mid tier between the RAM cache and
//! the persistent backend.
//!
//! Containers are filed into size classes: class `n` holds containers of
//! exactly `n` postings, up to a fixed number of slots per class. A
//! container that does not fit as a whole is split greedily into smaller
//! classes; whatever cannot be absorbed is handed back to the caller as a
//! remainder, which decides whether it returns to RAM or moves on to the
//! backend.

use std::collections::BTreeMap;

use crate::index::{Container, WordHash};

/// Bounded mid-tier store keyed by container size class.
#[derive(Debug)]
pub struct AssortmentCluster {
    /// classes[n - 1] holds containers with exactly n postings.
    classes: Vec<BTreeMap<WordHash, Container>>,

    /// Maximum containers per size class.
    slots_per_class: usize,
}

impl AssortmentCluster {
    /// Create a cluster with `class_count` size classes (1..=class_count
    /// postings) and `slots_per_class` containers per class.
    pub fn new(class_count: usize, slots_per_class: usize) -> Self {
        AssortmentCluster {
            classes: (0..class_count).map(|_| BTreeMap::new()).collect(),
            slots_per_class,
        }
    }

    /// Number of size classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Try to absorb a container. Returns the remainder that could not be
    /// stored, or `None` when everything was absorbed.
    ///
    /// A class can hold at most one entry per word; a word that already has
    /// an entry in a class cannot receive a second one there, but may still
    /// be filed into other classes after splitting.
    pub fn store(&mut self, container: Container) -> Option<Container> {
        let word = container.word();
        let mut rest = container;
        loop {
            let size = rest.len();
            if size == 0 {
                return None;
            }
            // the largest class that could take a piece of this container
            let mut class = size.min(self.classes.len());
            let placed = loop {
                if class == 0 {
                    break false;
                }
                let slot = &mut self.classes[class - 1];
                if slot.len() < self.slots_per_class && !slot.contains_key(&word) {
                    let piece = rest.take_first(class);
                    slot.insert(word, piece);
                    break true;
                }
                class -= 1;
            };
            if !placed {
                return Some(rest);
            }
        }
    }

    /// Remove and merge all entries for a word across all classes.
    pub fn take(&mut self, word: &WordHash) -> Option<Container> {
        let mut merged: Option<Container> = None;
        for class in self.classes.iter_mut() {
            if let Some(piece) = class.remove(word) {
                match merged.as_mut() {
                    Some(m) => {
                        m.merge(&piece);
                    }
                    None => merged = Some(piece),
                }
            }
        }
        merged
    }

    /// Distinct word hashes stored in the cluster, ascending.
    pub fn word_hashes(&self) -> Vec<WordHash> {
        let mut keys: Vec<WordHash> = self.classes.iter().flat_map(|c| c.keys().copied()).collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Number of distinct words in the cluster.
    pub fn word_count(&self) -> usize {
        self.word_hashes().len()
    }

    /// Entry count per size class, for introspection.
    pub fn class_sizes(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.len()).collect()
    }

    /// Drain every container out of the cluster (shutdown path).
    pub fn drain(&mut self) -> Vec<Container> {
        let mut out = Vec::new();
        for class in self.classes.iter_mut() {
            out.extend(std::mem::take(class).into_values());
        }
        out
    }
}
