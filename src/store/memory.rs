//! In-memory word store.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::index::{Container, DocHash, WordHash};
use crate::store::WordStore;

/// A [`WordStore`] backed by an ordered in-memory map. Fast but
/// non-persistent; intended for tests and temporary indexes.
#[derive(Debug, Default)]
pub struct MemoryWordStore {
    containers: RwLock<BTreeMap<WordHash, Container>>,
}

impl MemoryWordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryWordStore::default()
    }

    /// Total number of postings across all containers.
    pub fn posting_count(&self) -> usize {
        self.containers.read().values().map(|c| c.len()).sum()
    }
}

impl WordStore for MemoryWordStore {
    fn get(&self, word: &WordHash) -> Result<Option<Container>> {
        Ok(self.containers.read().get(word).cloned())
    }

    fn put(&self, container: Container) -> Result<usize> {
        let mut map = self.containers.write();
        match map.get_mut(&container.word()) {
            Some(existing) => Ok(existing.merge(&container)),
            None => {
                let added = container.len();
                map.insert(container.word(), container);
                Ok(added)
            }
        }
    }

    fn delete(&self, word: &WordHash) -> Result<bool> {
        Ok(self.containers.write().remove(word).is_some())
    }

    fn remove_documents(&self, word: &WordHash, docs: &[DocHash]) -> Result<usize> {
        let mut map = self.containers.write();
        let Some(container) = map.get_mut(word) else {
            return Ok(0);
        };
        let removed = container.remove_documents(docs);
        if container.is_empty() {
            map.remove(word);
        }
        Ok(removed)
    }

    fn iterate_from(&self, start: &WordHash) -> Result<Box<dyn Iterator<Item = WordHash> + Send>> {
        let keys: Vec<WordHash> = self.containers.read().range(*start..).map(|(k, _)| *k).collect();
        Ok(Box::new(keys.into_iter()))
    }

    fn len(&self) -> usize {
        self.containers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Posting;

    fn doc(n: u8) -> DocHash {
        DocHash::from_url(&format!("http://site-{n}.net/p"), &format!("site-{n}.net"))
    }

    #[test]
    fn test_put_merges() {
        let store = MemoryWordStore::new();
        let word = WordHash::from_word("cat");

        let mut a = Container::new(word);
        a.add(Posting::new(doc(1), 1, 10));
        assert_eq!(store.put(a).unwrap(), 1);

        let mut b = Container::new(word);
        b.add(Posting::new(doc(1), 1, 10));
        b.add(Posting::new(doc(2), 1, 10));
        assert_eq!(store.put(b).unwrap(), 1);

        assert_eq!(store.get(&word).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_remove_documents_deletes_empty_container() {
        let store = MemoryWordStore::new();
        let word = WordHash::from_word("cat");
        let mut c = Container::new(word);
        c.add(Posting::new(doc(1), 1, 10));
        store.put(c).unwrap();

        assert_eq!(store.remove_documents(&word, &[doc(1)]).unwrap(), 1);
        assert!(store.get(&word).unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_iterate_from_is_ascending() {
        let store = MemoryWordStore::new();
        for w in ["cat", "dog", "eel", "fox"] {
            let mut c = Container::new(WordHash::from_word(w));
            c.add(Posting::new(doc(1), 1, 10));
            store.put(c).unwrap();
        }
        let keys: Vec<WordHash> = store.iterate_from(&WordHash::MIN).unwrap().collect();
        assert_eq!(keys.len(), 4);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        // start bound is honored
        let partial: Vec<WordHash> = store.iterate_from(&keys[2]).unwrap().collect();
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0], keys[2]);
    }
}
