//! Document-metadata contract.
//!
//! The ranking process resolves document hashes into URL/title/content-type
//! records through this trait. The record store itself (crawler side) is an
//! external collaborator; a memory-backed implementation is provided for
//! tests and for carrying chunk metadata during index transfer.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::{Bitfield, DocHash, Posting};

/// Minimal per-document record: what ranking and transfer need, nothing
/// more.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document hash this record describes.
    pub doc: DocHash,

    /// Normalized URL of the document.
    pub url: String,

    /// Document title.
    pub title: String,

    /// Category flags, same layout as posting flags.
    pub flags: Bitfield,

    /// Number of image links in the document.
    pub image_count: u32,

    /// Number of audio links in the document.
    pub audio_count: u32,

    /// Number of video links in the document.
    pub video_count: u32,

    /// Number of application (download) links in the document.
    pub app_count: u32,
}

impl DocumentRecord {
    /// Create a record with no media links.
    pub fn new(doc: DocHash, url: &str, title: &str) -> Self {
        DocumentRecord {
            doc,
            url: url.to_string(),
            title: title.to_string(),
            flags: Bitfield::empty(),
            image_count: 0,
            audio_count: 0,
            video_count: 0,
            app_count: 0,
        }
    }
}

/// Lookup interface for document metadata.
pub trait DocumentStore: Send + Sync {
    /// Load the record for a document. The posting that referenced the
    /// document may be passed as a hint for stores that keep denormalized
    /// copies. Returns `Ok(None)` when the record does not exist (deleted
    /// or inconsistent store); that case is tracked by the ranking process
    /// as a miss, not an error.
    fn load(&self, doc: &DocHash, hint: Option<&Posting>) -> Result<Option<DocumentRecord>>;
}

/// Memory-backed document store for tests and transfer metadata.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    records: RwLock<BTreeMap<DocHash, DocumentRecord>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryDocumentStore::default()
    }

    /// Insert or replace a record.
    pub fn put(&self, record: DocumentRecord) {
        self.records.write().insert(record.doc, record);
    }

    /// Remove a record.
    pub fn remove(&self, doc: &DocHash) {
        self.records.write().remove(doc);
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, doc: &DocHash, _hint: Option<&Posting>) -> Result<Option<DocumentRecord>> {
        Ok(self.records.read().get(doc).cloned())
    }
}
