//! Integration tests for index distribution: quorum-conditional local
//! deletion and failure semantics.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nerita::cache::{TieredIndexConfig, TieredWordIndex};
use nerita::dht::{
    dht_distance, ChunkSelector, DhtChunk, DistributionConfig, IndexDistributor, Peer, PeerId,
    PeerTransport, RemoteSearchResult,
};
use nerita::error::{NeritaError, Result};
use nerita::index::{Bitfield, Container, DocHash, Posting, WordHash, HASH_LEN};
use nerita::metadata::{DocumentStore, MemoryDocumentStore};
use nerita::store::{MemoryWordStore, WordStore};

fn doc(n: usize) -> DocHash {
    DocHash::from_url(&format!("http://site-{n}.net/page"), &format!("site-{n}.net"))
}

/// Transport double: `failing` of the `count` peers reject transfers.
/// Accepted chunks are recorded per peer.
struct TestTransport {
    peers: Vec<Peer>,
    failing: BTreeSet<PeerId>,
    accepted: Mutex<Vec<(PeerId, usize)>>,
    departed: AtomicUsize,
}

impl TestTransport {
    fn new(count: usize, failing: usize) -> Self {
        let peers: Vec<Peer> = (0..count)
            .map(|n| Peer {
                id: PeerId([b'A' + n as u8; HASH_LEN]),
                name: format!("peer-{n}"),
            })
            .collect();
        let failing = peers.iter().take(failing).map(|p| p.id).collect();
        TestTransport {
            peers,
            failing,
            accepted: Mutex::new(Vec::new()),
            departed: AtomicUsize::new(0),
        }
    }

    fn accepted_postings(&self) -> usize {
        self.accepted.lock().iter().map(|(_, n)| n).sum()
    }
}

impl PeerTransport for TestTransport {
    fn own_id(&self) -> PeerId {
        // keyspace start: the own distance never constrains candidates
        PeerId([b'-'; HASH_LEN])
    }

    fn transfer_index(&self, peer: &Peer, chunk: &DhtChunk, _gzip: bool, _timeout: Duration) -> Result<()> {
        if self.failing.contains(&peer.id) {
            return Err(NeritaError::distribution("simulated transfer failure"));
        }
        self.accepted.lock().push((peer.id, chunk.posting_count()));
        Ok(())
    }

    fn query_remote(
        &self,
        _peer: &Peer,
        _include: &BTreeSet<WordHash>,
        _exclude: &BTreeSet<WordHash>,
        _constraint: Option<Bitfield>,
        _timeout: Duration,
    ) -> Result<RemoteSearchResult> {
        Ok(RemoteSearchResult::default())
    }

    fn query_secondary(
        &self,
        _peer: &Peer,
        _words: &BTreeSet<WordHash>,
        _candidates: &BTreeSet<DocHash>,
        _timeout: Duration,
    ) -> Result<Vec<Container>> {
        Ok(Vec::new())
    }

    fn eligible_peers_by_distance(&self, word: &WordHash) -> Vec<Peer> {
        let mut peers = self.peers.clone();
        peers.sort_by(|a, b| {
            dht_distance(&a.id, word)
                .partial_cmp(&dht_distance(&b.id, word))
                .unwrap()
        });
        peers
    }

    fn mark_departed(&self, _peer: &Peer) {
        self.departed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport double whose first transfer blocks until the gate opens;
/// later transfers pass straight through.
struct GatedTransport {
    peers: Vec<Peer>,
    started: AtomicUsize,
    gate: Mutex<bool>,
    opened: Condvar,
}

impl GatedTransport {
    fn new(count: usize) -> Self {
        let peers = (0..count)
            .map(|n| Peer {
                id: PeerId([b'A' + n as u8; HASH_LEN]),
                name: format!("peer-{n}"),
            })
            .collect();
        GatedTransport {
            peers,
            started: AtomicUsize::new(0),
            gate: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn open_gate(&self) {
        let mut open = self.gate.lock();
        *open = true;
        self.opened.notify_all();
    }

    fn wait_for_first_transfer(&self) {
        for _ in 0..200 {
            if self.started.load(Ordering::SeqCst) > 0 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("no transfer started");
    }
}

impl PeerTransport for GatedTransport {
    fn own_id(&self) -> PeerId {
        PeerId([b'-'; HASH_LEN])
    }

    fn transfer_index(&self, _peer: &Peer, _chunk: &DhtChunk, _gzip: bool, _timeout: Duration) -> Result<()> {
        let first = self.started.fetch_add(1, Ordering::SeqCst) == 0;
        if first {
            let mut open = self.gate.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
        Ok(())
    }

    fn query_remote(
        &self,
        _peer: &Peer,
        _include: &BTreeSet<WordHash>,
        _exclude: &BTreeSet<WordHash>,
        _constraint: Option<Bitfield>,
        _timeout: Duration,
    ) -> Result<RemoteSearchResult> {
        Ok(RemoteSearchResult::default())
    }

    fn query_secondary(
        &self,
        _peer: &Peer,
        _words: &BTreeSet<WordHash>,
        _candidates: &BTreeSet<DocHash>,
        _timeout: Duration,
    ) -> Result<Vec<Container>> {
        Ok(Vec::new())
    }

    fn eligible_peers_by_distance(&self, _word: &WordHash) -> Vec<Peer> {
        self.peers.clone()
    }

    fn mark_departed(&self, _peer: &Peer) {}
}

fn setup(
    dir: &std::path::Path,
    transport: Arc<TestTransport>,
) -> (Arc<IndexDistributor>, Arc<TieredWordIndex>) {
    setup_with(dir, transport as Arc<dyn PeerTransport>, DistributionConfig::default())
}

fn setup_with(
    dir: &std::path::Path,
    transport: Arc<dyn PeerTransport>,
    config: DistributionConfig,
) -> (Arc<IndexDistributor>, Arc<TieredWordIndex>) {
    let backend = Arc::new(MemoryWordStore::new());
    let index = Arc::new(
        TieredWordIndex::open(dir, backend as Arc<dyn WordStore>, TieredIndexConfig::default()).unwrap(),
    );
    let docs = Arc::new(MemoryDocumentStore::new());
    let selector = Arc::new(ChunkSelector::new(Arc::clone(&index), docs as Arc<dyn DocumentStore>));
    let distributor = Arc::new(IndexDistributor::new(
        Arc::clone(&index),
        selector,
        transport,
        config,
    ));
    (distributor, index)
}

fn posting_total(index: &TieredWordIndex) -> usize {
    ["cat", "dog", "eel"]
        .iter()
        .map(|w| {
            index
                .lookup(&WordHash::from_word(w))
                .unwrap()
                .map_or(0, |c| c.len())
        })
        .sum()
}

fn seed(index: &TieredWordIndex) -> usize {
    let mut total = 0;
    for (word, docs) in [("cat", 0..3), ("dog", 3..5), ("eel", 5..6)] {
        for n in docs {
            index
                .insert(
                    Container::with_posting(WordHash::from_word(word), Posting::new(doc(n), 1, 100), 100),
                    100,
                )
                .unwrap();
            total += 1;
        }
    }
    total
}

#[test]
fn test_quorum_success_transfers_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(TestTransport::new(4, 0));
    let (distributor, index) = setup(dir.path(), Arc::clone(&transport));
    let seeded = seed(&index);

    let transferred = distributor.distribute_once(distributor.index_count(), 2).unwrap();
    assert_eq!(transferred, seeded);
    // two acknowledgments, each carrying the whole chunk
    assert_eq!(transport.accepted_postings(), seeded * 2);
    for word in ["cat", "dog", "eel"] {
        assert!(index.lookup(&WordHash::from_word(word)).unwrap().is_none());
    }
    index.close().unwrap();
}

#[test]
fn test_below_quorum_preserves_local_index() {
    let dir = tempfile::tempdir().unwrap();
    // quorum of 3 against 4 peers of which 2 always fail
    let transport = Arc::new(TestTransport::new(4, 2));
    let (distributor, index) = setup(dir.path(), Arc::clone(&transport));
    seed(&index);

    let result = distributor.distribute_once(distributor.index_count(), 3);
    assert!(matches!(result, Err(NeritaError::Distribution(_))));
    assert!(transport.departed.load(Ordering::SeqCst) >= 1);

    // every posting still readable locally
    assert_eq!(index.lookup(&WordHash::from_word("cat")).unwrap().unwrap().len(), 3);
    assert_eq!(index.lookup(&WordHash::from_word("dog")).unwrap().unwrap().len(), 2);
    assert_eq!(index.lookup(&WordHash::from_word("eel")).unwrap().unwrap().len(), 1);
    index.close().unwrap();
}

#[test]
fn test_failed_chunk_is_reselected_later() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(TestTransport::new(2, 2));
    let (distributor, index) = setup(dir.path(), Arc::clone(&transport));
    seed(&index);

    // every peer fails: repeated attempts keep failing but never lose data
    for _ in 0..3 {
        assert!(distributor.distribute_once(distributor.index_count(), 1).is_err());
    }
    assert_eq!(index.lookup(&WordHash::from_word("cat")).unwrap().unwrap().len(), 3);
    index.close().unwrap();
}

#[test]
fn test_empty_index_distributes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(TestTransport::new(4, 0));
    let (distributor, index) = setup(dir.path(), Arc::clone(&transport));

    assert_eq!(distributor.distribute_once(distributor.index_count(), 2).unwrap(), 0);
    assert_eq!(transport.accepted_postings(), 0);
    index.close().unwrap();
}

#[test]
fn test_abort_discards_in_flight_transfer_without_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(GatedTransport::new(2));
    let (distributor, index) = setup_with(
        dir.path(),
        Arc::clone(&transport) as Arc<dyn PeerTransport>,
        DistributionConfig::default(),
    );
    seed(&index);

    let target = transport.peers[0].clone();
    distributor.start_full_distribution(target, true).unwrap();
    transport.wait_for_first_transfer();

    // the abort returns without waiting for the blocked transfer
    let called = Instant::now();
    distributor.abort_full_distribution();
    assert!(called.elapsed() < Duration::from_secs(1));
    assert!(!distributor.is_distributing());

    // the aborted chunk was never deleted locally
    assert_eq!(index.lookup(&WordHash::from_word("cat")).unwrap().unwrap().len(), 3);
    assert_eq!(index.lookup(&WordHash::from_word("dog")).unwrap().unwrap().len(), 2);
    assert_eq!(index.lookup(&WordHash::from_word("eel")).unwrap().unwrap().len(), 1);

    // release the detached worker so it can exit
    transport.open_gate();
    index.close().unwrap();
}

#[test]
fn test_pause_defers_deletion_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(GatedTransport::new(2));
    // small chunks so the keyspace walk spans several transfers
    let config = DistributionConfig {
        min_index_count: 1,
        initial_index_count: 2,
        ..DistributionConfig::default()
    };
    let (distributor, index) = setup_with(
        dir.path(),
        Arc::clone(&transport) as Arc<dyn PeerTransport>,
        config,
    );
    seed(&index);

    let target = transport.peers[0].clone();
    distributor.start_full_distribution(target, true).unwrap();
    transport.wait_for_first_transfer();
    distributor.pause_full_distribution();
    transport.open_gate();

    // at most the chunk joined before the pause took effect is deleted
    thread::sleep(Duration::from_millis(400));
    let held = posting_total(&index);
    assert!(held >= 4, "paused job kept deleting, {held} postings left");

    distributor.resume_full_distribution();
    for _ in 0..100 {
        if posting_total(&index) == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(posting_total(&index), 0);
    distributor.stop_full_distribution();
    assert!(!distributor.is_distributing());
    index.close().unwrap();
}
