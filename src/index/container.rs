//! The container: the ordered set of postings for one word.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::index::posting::{DocHash, Posting, WordHash};

/// All postings known for one word, keyed by document hash.
///
/// A container never holds two postings for the same document. Merging two
/// containers for the same word unions their postings; on conflict the
/// posting with the newer `last_modified` wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Container {
    /// The word these postings belong to.
    word: WordHash,

    /// Postings, unique by document hash, in ascending hash order.
    postings: BTreeMap<DocHash, Posting>,

    /// Time of the last merge into this container, epoch millis.
    last_update: u64,
}

impl Container {
    /// Create an empty container for a word.
    pub fn new(word: WordHash) -> Self {
        Container {
            word,
            postings: BTreeMap::new(),
            last_update: 0,
        }
    }

    /// Create a container holding a single posting.
    pub fn with_posting(word: WordHash, posting: Posting, update_time: u64) -> Self {
        let mut c = Container::new(word);
        c.add(posting);
        c.last_update = update_time;
        c
    }

    /// The word hash of this container.
    pub fn word(&self) -> WordHash {
        self.word
    }

    /// Number of postings.
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    /// True if the container holds no postings.
    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Time of the last merge into this container.
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Set the last-update time (used when restoring from a dump).
    pub fn set_last_update(&mut self, time: u64) {
        self.last_update = time;
    }

    /// Add a single posting. Returns true if the posting was added or
    /// replaced an older one; false if an equal-or-newer posting for the
    /// same document was already present.
    pub fn add(&mut self, posting: Posting) -> bool {
        match self.postings.get(&posting.doc) {
            None => {
                self.postings.insert(posting.doc, posting);
                true
            }
            Some(existing) if posting.newer_than(existing) => {
                self.postings.insert(posting.doc, posting);
                true
            }
            Some(_) => false,
        }
    }

    /// Merge another container for the same word into this one.
    /// Returns the number of postings actually added (not counting
    /// duplicates that lost the newer-wins tie-break).
    pub fn merge(&mut self, other: &Container) -> usize {
        debug_assert_eq!(self.word, other.word);
        let mut added = 0;
        for posting in other.postings.values() {
            if self.add(*posting) {
                added += 1;
            }
        }
        if other.last_update > self.last_update {
            self.last_update = other.last_update;
        }
        added
    }

    /// Get the posting for a document, if present.
    pub fn get(&self, doc: &DocHash) -> Option<&Posting> {
        self.postings.get(doc)
    }

    /// True if the container holds a posting for the document.
    pub fn contains(&self, doc: &DocHash) -> bool {
        self.postings.contains_key(doc)
    }

    /// Iterate over the postings in ascending document-hash order.
    pub fn postings(&self) -> impl Iterator<Item = &Posting> {
        self.postings.values()
    }

    /// Document hashes in ascending order.
    pub fn doc_hashes(&self) -> impl Iterator<Item = &DocHash> {
        self.postings.keys()
    }

    /// Remove the postings for the given documents. Returns how many were
    /// actually removed.
    pub fn remove_documents(&mut self, docs: &[DocHash]) -> usize {
        let mut removed = 0;
        for doc in docs {
            if self.postings.remove(doc).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Split off the first `n` postings (in document-hash order) into a new
    /// container, removing them from this one. Size-bounded extraction for
    /// chunking.
    pub fn take_first(&mut self, n: usize) -> Container {
        let mut taken = Container::new(self.word);
        taken.last_update = self.last_update;
        let keys: Vec<DocHash> = self.postings.keys().take(n).copied().collect();
        for key in keys {
            if let Some(p) = self.postings.remove(&key) {
                taken.postings.insert(key, p);
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::posting::Bitfield;

    fn doc(n: u8) -> DocHash {
        DocHash::from_url(&format!("http://site-{n}.net/p"), &format!("site-{n}.net"))
    }

    fn container(word: &str, postings: &[(DocHash, u64)]) -> Container {
        let mut c = Container::new(WordHash::from_word(word));
        for &(d, t) in postings {
            c.add(Posting::new(d, 1, t));
        }
        c
    }

    #[test]
    fn test_merge_unions_postings() {
        let mut a = container("cat", &[(doc(1), 10), (doc(2), 10)]);
        let b = container("cat", &[(doc(2), 10), (doc(3), 10)]);
        let added = a.merge(&b);
        assert_eq!(added, 1);
        assert_eq!(a.len(), 3);
        assert!(a.contains(&doc(1)));
        assert!(a.contains(&doc(3)));
    }

    #[test]
    fn test_merge_commutative_up_to_newer_wins() {
        let a = container("cat", &[(doc(1), 10), (doc(2), 10)]);
        let b = container("cat", &[(doc(2), 10), (doc(3), 10)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        let ab_docs: Vec<_> = ab.doc_hashes().copied().collect();
        let ba_docs: Vec<_> = ba.doc_hashes().copied().collect();
        assert_eq!(ab_docs, ba_docs);
    }

    #[test]
    fn test_merge_newer_wins() {
        let mut old = Container::new(WordHash::from_word("cat"));
        let mut p_old = Posting::new(doc(1), 5, 100);
        p_old.flags = Bitfield::with(&[Bitfield::HAS_IMAGE]);
        old.add(p_old);

        let mut newer = Container::new(WordHash::from_word("cat"));
        newer.add(Posting::new(doc(1), 9, 200));

        old.merge(&newer);
        assert_eq!(old.len(), 1);
        let kept = old.get(&doc(1)).unwrap();
        assert_eq!(kept.pos_in_text, 9);
        assert_eq!(kept.last_modified, 200);

        // merging the older one back changes nothing
        let mut roundtrip = Container::new(WordHash::from_word("cat"));
        roundtrip.add(p_old);
        assert_eq!(old.merge(&roundtrip), 0);
        assert_eq!(old.get(&doc(1)).unwrap().last_modified, 200);
    }

    #[test]
    fn test_take_first_extracts_prefix() {
        let mut c = container("cat", &[(doc(1), 1), (doc(2), 1), (doc(3), 1), (doc(4), 1)]);
        let total = c.len();
        let taken = c.take_first(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(c.len(), total - 2);
        // no overlap
        for d in taken.doc_hashes() {
            assert!(!c.contains(d));
        }
    }

    #[test]
    fn test_remove_documents() {
        let mut c = container("cat", &[(doc(1), 1), (doc(2), 1)]);
        assert_eq!(c.remove_documents(&[doc(1), doc(9)]), 1);
        assert_eq!(c.len(), 1);
    }
}
