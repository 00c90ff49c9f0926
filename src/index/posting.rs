//! Word/document hashes and the posting record.
//!
//! Hashes are fixed-length opaque identifiers encoded over an ASCII-ordered
//! base64 alphabet, so lexicographic byte order equals alphabet order. A
//! [`WordHash`] doubles as the DHT coordinate of a word; a [`DocHash`]
//! carries the site identifier of its document in the trailing bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length in bytes of word, document and peer hashes.
pub const HASH_LEN: usize = 12;

/// Number of trailing bytes of a document hash that identify the site
/// (origin host) of the document.
pub const DOMAIN_LEN: usize = 6;

/// ASCII-ordered base64 alphabet. Because the characters are strictly
/// ascending, byte-wise comparison of encoded hashes equals comparison of
/// the underlying bit strings.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Seeds for the word/document hash derivation. Fixed so that hashes are
/// stable across processes and peers.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xf39c_c060_5ced_c834,
    0x1082_276b_f3a2_7251,
    0x7109_87c8_825a_2fb5,
);

fn encode12(mut bits: u128) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(bits & 0x3f) as usize];
        bits >>= 6;
    }
    out
}

fn hash_token(token: &str) -> u128 {
    use std::hash::{BuildHasher, Hasher};
    let build = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    let mut hasher = build.build_hasher();
    hasher.write(token.as_bytes());
    let lo = hasher.finish();
    let mut hasher = build.build_hasher();
    hasher.write(token.as_bytes());
    hasher.write_u64(lo);
    let hi = hasher.finish();
    ((hi as u128) << 64) | lo as u128
}

fn decode_position(bytes: &[u8]) -> f64 {
    // Interpret the first ten characters as a 60-bit fraction of the
    // keyspace.
    let mut acc: u64 = 0;
    for &b in bytes.iter().take(10) {
        let idx = ALPHABET.iter().position(|&a| a == b).unwrap_or(0) as u64;
        acc = (acc << 6) | idx;
    }
    acc as f64 / (1u64 << 60) as f64
}

/// Fixed-length identifier of a word, totally ordered, used as both a cache
/// key and a DHT coordinate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordHash(pub [u8; HASH_LEN]);

impl WordHash {
    /// The smallest hash in the keyspace (cursor wrap-around target).
    pub const MIN: WordHash = WordHash([b'-'; HASH_LEN]);

    /// The largest hash in the keyspace.
    pub const MAX: WordHash = WordHash([b'z'; HASH_LEN]);

    /// Derive the hash of a word. The word is lowercased first, so hashes
    /// are case-insensitive.
    pub fn from_word(word: &str) -> Self {
        WordHash(encode12(hash_token(&word.to_lowercase())))
    }

    /// Position of this hash in the keyspace, as a fraction in `[0, 1)`.
    /// Used by the DHT distance metric.
    pub fn position(&self) -> f64 {
        decode_position(&self.0)
    }

    /// Raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for WordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WordHash({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for WordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Site identifier: the trailing bytes of a document hash, shared by all
/// documents of the same origin host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub [u8; DOMAIN_LEN]);

/// Fixed-length identifier of a document.
///
/// The leading bytes are derived from the full URL, the trailing
/// [`DOMAIN_LEN`] bytes from the host only, so documents of one site share
/// a common suffix. The ranking process uses that suffix for its domain
/// diversity policy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocHash(pub [u8; HASH_LEN]);

impl DocHash {
    /// Derive a document hash from a URL string and its host part.
    pub fn from_url(url: &str, host: &str) -> Self {
        let head = encode12(hash_token(url));
        let tail = encode12(hash_token(&host.to_lowercase()));
        let mut bytes = [0u8; HASH_LEN];
        bytes[..HASH_LEN - DOMAIN_LEN].copy_from_slice(&head[..HASH_LEN - DOMAIN_LEN]);
        bytes[HASH_LEN - DOMAIN_LEN..].copy_from_slice(&tail[..DOMAIN_LEN]);
        DocHash(bytes)
    }

    /// The site identifier of this document.
    pub fn domain(&self) -> DomainId {
        let mut d = [0u8; DOMAIN_LEN];
        d.copy_from_slice(&self.0[HASH_LEN - DOMAIN_LEN..]);
        DomainId(d)
    }

    /// Raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for DocHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocHash({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for DocHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A 32-bit flag set attached to postings and used for query constraints.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Bitfield(pub u32);

impl Bitfield {
    /// Document contains image links.
    pub const HAS_IMAGE: u32 = 20;
    /// Document contains audio links.
    pub const HAS_AUDIO: u32 = 21;
    /// Document contains video links.
    pub const HAS_VIDEO: u32 = 22;
    /// Document contains application (download) links.
    pub const HAS_APP: u32 = 23;

    /// An empty flag set.
    pub fn empty() -> Self {
        Bitfield(0)
    }

    /// Set a single bit.
    pub fn set(&mut self, bit: u32) {
        self.0 |= 1 << bit;
    }

    /// Build a flag set from a list of bits.
    pub fn with(bits: &[u32]) -> Self {
        let mut f = Bitfield(0);
        for &b in bits {
            f.set(b);
        }
        f
    }

    /// Test a single bit.
    pub fn get(&self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    /// True if every bit set in `constraint` is also set here.
    pub fn matches_all(&self, constraint: Bitfield) -> bool {
        self.0 & constraint.0 == constraint.0
    }

    /// True if at least one bit set in `constraint` is also set here.
    pub fn matches_any(&self, constraint: Bitfield) -> bool {
        self.0 & constraint.0 != 0
    }
}

/// One word occurrence record: the per-document entry of a container.
/// Unique per (word hash, document hash).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Document this posting refers to.
    pub doc: DocHash,

    /// Position of the first occurrence of the word in the document text.
    pub pos_in_text: u32,

    /// Total number of words in the document (ranking field).
    pub word_count: u32,

    /// Last modification time of the source document, epoch millis.
    /// The newer posting wins when containers are merged.
    pub last_modified: u64,

    /// Document category flags.
    pub flags: Bitfield,

    /// Crawl-time quality estimate (ranking field).
    pub quality: u8,
}

impl Posting {
    /// Create a minimal posting for a document.
    pub fn new(doc: DocHash, pos_in_text: u32, last_modified: u64) -> Self {
        Posting {
            doc,
            pos_in_text,
            word_count: 0,
            last_modified,
            flags: Bitfield::empty(),
            quality: 0,
        }
    }

    /// True if this posting carries newer document state than `other`.
    pub fn newer_than(&self, other: &Posting) -> bool {
        self.last_modified > other.last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_hash_stable_and_case_insensitive() {
        let a = WordHash::from_word("Cat");
        let b = WordHash::from_word("cat");
        assert_eq!(a, b);
        assert_ne!(a, WordHash::from_word("dog"));
    }

    #[test]
    fn test_hash_alphabet_ordering() {
        assert!(WordHash::MIN < WordHash::from_word("anything"));
        assert!(WordHash::from_word("anything") < WordHash::MAX);
        assert!(WordHash::MIN.position() < 1e-9);
    }

    #[test]
    fn test_doc_hash_domain_suffix() {
        let a = DocHash::from_url("http://site-a.net/page1", "site-a.net");
        let b = DocHash::from_url("http://site-a.net/page2", "site-a.net");
        let c = DocHash::from_url("http://site-b.net/page1", "site-b.net");
        assert_ne!(a, b);
        assert_eq!(a.domain(), b.domain());
        assert_ne!(a.domain(), c.domain());
    }

    #[test]
    fn test_bitfield_matching() {
        let flags = Bitfield::with(&[Bitfield::HAS_IMAGE, Bitfield::HAS_AUDIO]);
        assert!(flags.get(Bitfield::HAS_IMAGE));
        assert!(!flags.get(Bitfield::HAS_VIDEO));
        assert!(flags.matches_all(Bitfield::with(&[Bitfield::HAS_IMAGE])));
        assert!(!flags.matches_all(Bitfield::with(&[Bitfield::HAS_IMAGE, Bitfield::HAS_VIDEO])));
        assert!(flags.matches_any(Bitfield::with(&[Bitfield::HAS_VIDEO, Bitfield::HAS_AUDIO])));
    }
}
