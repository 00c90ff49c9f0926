//! Core data model: word/document hashes, postings and containers.

pub mod container;
pub mod posting;

pub use container::Container;
pub use posting::{Bitfield, DocHash, DomainId, Posting, WordHash, DOMAIN_LEN, HASH_LEN};
