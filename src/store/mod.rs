//! Persistent backend abstraction for word containers.
//!
//! The tiered index flushes containers that fall out of its RAM and
//! assortment tiers into a [`WordStore`]. The store is pluggable: tests and
//! small deployments use the in-memory backend, production peers wire in a
//! disk-backed implementation. The contract is deliberately small; the
//! cache layer owns all policy.

use crate::error::Result;
use crate::index::{Container, DocHash, WordHash};

pub mod memory;

pub use memory::MemoryWordStore;

/// A backend that can store and retrieve word containers.
pub trait WordStore: Send + Sync + std::fmt::Debug {
    /// Get the container for a word, if the store holds one.
    fn get(&self, word: &WordHash) -> Result<Option<Container>>;

    /// Merge a container into the store. Returns the number of postings
    /// actually added (deduplicated against the stored container).
    fn put(&self, container: Container) -> Result<usize>;

    /// Delete the container for a word. Returns true if one existed.
    fn delete(&self, word: &WordHash) -> Result<bool>;

    /// Remove the postings for specific documents from a word's container,
    /// deleting the container when it becomes empty. Returns the number of
    /// postings removed.
    fn remove_documents(&self, word: &WordHash, docs: &[DocHash]) -> Result<usize>;

    /// Word hashes stored here, ascending, starting at `start` (inclusive).
    fn iterate_from(&self, start: &WordHash) -> Result<Box<dyn Iterator<Item = WordHash> + Send>>;

    /// Number of words in the store.
    fn len(&self) -> usize;

    /// True if the store holds no words.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
