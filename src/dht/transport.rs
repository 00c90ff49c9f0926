//! Peer identity, DHT distance and the peer transport abstraction.
//!
//! The transport is a collaborator contract: the engine never opens sockets
//! itself. Tests and embedders provide an implementation; the engine only
//! relies on the distance metric and the call semantics defined here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::{Bitfield, Container, DocHash, WordHash, HASH_LEN};

/// Fixed-length peer identifier, encoded over the same alphabet as word
/// hashes so that peers and words share one circular keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; HASH_LEN]);

impl PeerId {
    /// Position of this peer on the keyspace circle, as a fraction in
    /// `[0, 1)`.
    pub fn position(&self) -> f64 {
        WordHash(self.0).position()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A known remote peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
}

/// Forward distance from a peer to a word on the circular keyspace: how far
/// the word lies ahead of the peer, in `[0, 1)`. A peer is responsible for
/// words a short distance ahead of its own position.
pub fn dht_distance(peer: &PeerId, word: &WordHash) -> f64 {
    let d = word.position() - peer.position();
    if d < 0.0 { d + 1.0 } else { d }
}

/// Index abstract: for each queried word, the documents a peer knows about
/// and which peers contributed them. Compact enough to ship with a primary
/// search response, rich enough to drive the secondary search join.
pub type IndexAbstract = BTreeMap<WordHash, BTreeMap<DocHash, Vec<PeerId>>>;

/// Response of a primary remote search.
#[derive(Clone, Debug, Default)]
pub struct RemoteSearchResult {
    /// Containers matching the conjunctive query on the remote peer.
    pub containers: Vec<Container>,

    /// Per-word abstracts for the secondary search phase.
    pub abstracts: IndexAbstract,
}

/// Network operations the engine needs from its host. Every call carries an
/// explicit timeout; a timed-out call returns an error like any other
/// transport failure.
pub trait PeerTransport: Send + Sync {
    /// Identifier of the local peer.
    fn own_id(&self) -> PeerId;

    /// Transfer a batch of containers plus document metadata to a peer.
    fn transfer_index(
        &self,
        peer: &Peer,
        chunk: &crate::dht::DhtChunk,
        gzip: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Ask a peer to run a conjunctive query locally and return matching
    /// postings together with its index abstracts.
    fn query_remote(
        &self,
        peer: &Peer,
        include: &BTreeSet<WordHash>,
        exclude: &BTreeSet<WordHash>,
        constraint: Option<Bitfield>,
        timeout: Duration,
    ) -> Result<RemoteSearchResult>;

    /// Narrow second-round query: only the named words, restricted to the
    /// given candidate documents.
    fn query_secondary(
        &self,
        peer: &Peer,
        words: &BTreeSet<WordHash>,
        candidates: &BTreeSet<DocHash>,
        timeout: Duration,
    ) -> Result<Vec<Container>>;

    /// Peers eligible to receive index chunks near a word, ordered by
    /// ascending DHT distance.
    fn eligible_peers_by_distance(&self, word: &WordHash) -> Vec<Peer>;

    /// Record that a peer did not respond; it will be skipped until it is
    /// seen again.
    fn mark_departed(&self, peer: &Peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dht_distance_wraps_forward() {
        let peer = PeerId([b'a'; HASH_LEN]);
        let ahead = WordHash([b'z'; HASH_LEN]);
        let behind = WordHash([b'0'; HASH_LEN]);

        let d_ahead = dht_distance(&peer, &ahead);
        let d_behind = dht_distance(&peer, &behind);
        assert!(d_ahead > 0.0 && d_ahead < 1.0);
        assert!(d_behind > 0.0 && d_behind < 1.0);
        // the word behind the peer is reached by wrapping, so it is farther
        assert!(d_behind > d_ahead);
    }

    #[test]
    fn test_distance_to_own_position_is_zero() {
        let peer = PeerId([b'm'; HASH_LEN]);
        let word = WordHash([b'm'; HASH_LEN]);
        assert!(dht_distance(&peer, &word).abs() < 1e-12);
    }
}
