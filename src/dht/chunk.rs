//! Chunk selection: cutting a contiguous slice of the local index for
//! transfer to remote peers.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::cache::TieredWordIndex;
use crate::error::{NeritaError, Result};
use crate::index::{Container, DocHash, WordHash};
use crate::metadata::{DocumentRecord, DocumentStore};

/// A contiguous slice of the index prepared for one transfer: containers in
/// strictly ascending word-hash order plus the metadata of every document
/// they reference that could be resolved locally.
#[derive(Clone, Debug)]
pub struct DhtChunk {
    containers: Vec<Container>,
    metadata: BTreeMap<DocHash, DocumentRecord>,
}

impl DhtChunk {
    /// Build a chunk from ascending non-empty containers. Rejects an empty
    /// sequence and out-of-order or duplicate word hashes.
    pub fn new(containers: Vec<Container>, metadata: BTreeMap<DocHash, DocumentRecord>) -> Result<Self> {
        if containers.is_empty() {
            return Err(NeritaError::distribution("empty chunk"));
        }
        for pair in containers.windows(2) {
            if pair[0].word() >= pair[1].word() {
                return Err(NeritaError::distribution("chunk containers not strictly ascending"));
            }
        }
        if containers.iter().any(|c| c.is_empty()) {
            return Err(NeritaError::distribution("chunk contains empty container"));
        }
        Ok(DhtChunk { containers, metadata })
    }

    /// Smallest word hash in the chunk.
    pub fn first(&self) -> WordHash {
        self.containers[0].word()
    }

    /// Largest word hash in the chunk.
    pub fn last(&self) -> WordHash {
        self.containers[self.containers.len() - 1].word()
    }

    /// The containers, ascending by word hash.
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    /// Resolved metadata for the referenced documents.
    pub fn metadata(&self) -> &BTreeMap<DocHash, DocumentRecord> {
        &self.metadata
    }

    /// Total number of postings across all containers.
    pub fn posting_count(&self) -> usize {
        self.containers.iter().map(|c| c.len()).sum()
    }
}

/// Walks the index keyspace with a rotating cursor and cuts posting-bounded
/// chunks. The cursor only advances, wrapping to the smallest hash at the
/// end of the keyspace, so successive chunks cover non-decreasing ranges.
pub struct ChunkSelector {
    index: Arc<TieredWordIndex>,
    metadata: Arc<dyn DocumentStore>,
    cursor: Mutex<WordHash>,
}

impl ChunkSelector {
    pub fn new(index: Arc<TieredWordIndex>, metadata: Arc<dyn DocumentStore>) -> Self {
        ChunkSelector {
            index,
            metadata,
            cursor: Mutex::new(WordHash::MIN),
        }
    }

    /// Current cursor position.
    pub fn cursor(&self) -> WordHash {
        *self.cursor.lock()
    }

    /// Select the next chunk of up to `max_postings` postings at the
    /// rotating cursor, wrapping once at the end of the keyspace. Returns
    /// `None` when the index holds nothing to distribute.
    pub fn select(&self, max_postings: usize) -> Result<Option<DhtChunk>> {
        let mut cursor = self.cursor.lock();
        let picked = match self.select_from(&cursor, max_postings)? {
            Some(picked) => Some(picked),
            None if *cursor != WordHash::MIN => {
                debug!("chunk cursor wrapped to keyspace start");
                self.select_from(&WordHash::MIN, max_postings)?
            }
            None => None,
        };
        match picked {
            Some((chunk, next)) => {
                *cursor = next;
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Select a chunk starting at `start` without wrapping. Returns the
    /// chunk together with the cursor for the next selection: the last word
    /// itself when it was only partially taken, its successor otherwise.
    pub fn select_from(
        &self,
        start: &WordHash,
        max_postings: usize,
    ) -> Result<Option<(DhtChunk, WordHash)>> {
        let words: Vec<WordHash> = self.index.word_hashes_from(start)?.collect();
        let mut containers: Vec<Container> = Vec::new();
        let mut taken = 0usize;
        let mut partial_last = false;

        for word in words {
            let Some(mut container) = self.index.lookup(&word)? else {
                continue;
            };
            if container.is_empty() {
                continue;
            }
            let room = max_postings.saturating_sub(taken);
            if room == 0 {
                break;
            }
            if container.len() > room {
                container = container.take_first(room);
                partial_last = true;
            }
            taken += container.len();
            containers.push(container);
            if taken >= max_postings {
                break;
            }
        }

        if containers.is_empty() {
            return Ok(None);
        }

        let mut metadata = BTreeMap::new();
        for container in &containers {
            for posting in container.postings() {
                if metadata.contains_key(&posting.doc) {
                    continue;
                }
                if let Some(record) = self.metadata.load(&posting.doc, Some(posting))? {
                    metadata.insert(posting.doc, record);
                }
            }
        }

        let last = containers[containers.len() - 1].word();
        let next = if partial_last {
            last
        } else {
            successor(&last).unwrap_or(WordHash::MIN)
        };
        let chunk = DhtChunk::new(containers, metadata)?;
        debug!(
            "selected chunk {}..{} ({} postings, {} records)",
            chunk.first(),
            chunk.last(),
            chunk.posting_count(),
            chunk.metadata().len()
        );
        Ok(Some((chunk, next)))
    }
}

/// Smallest hash strictly greater than `w` in byte order, or `None` at the
/// top of the keyspace. Used only as a range start, so it need not be a
/// valid encoded hash.
pub(crate) fn successor(w: &WordHash) -> Option<WordHash> {
    let mut bytes = w.0;
    for b in bytes.iter_mut().rev() {
        if *b < u8::MAX {
            *b += 1;
            return Some(WordHash(bytes));
        }
        *b = 0;
    }
    None
}
