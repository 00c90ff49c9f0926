//! One search, end to end: local retrieval, remote fan-out, secondary
//! search over index abstracts, merge, and asynchronous flush-back of
//! remotely learned postings.
//!
//! Every phase is deadline-driven. A phase whose budget elapses hands over
//! whatever partial results exist; budget exhaustion is reported in the
//! stats, never as an error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cache::{now_millis, TieredWordIndex};
use crate::dht::transport::{IndexAbstract, Peer, PeerTransport, RemoteSearchResult};
use crate::error::Result;
use crate::index::{Container, DocHash, Posting, WordHash};
use crate::metadata::DocumentStore;
use crate::search::process::{RankingProcess, SearchResultEntry};
use crate::search::query::{Query, SearchScope};
use crate::search::ranking::RankingProfile;

/// Configuration of the search orchestration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Bound of the per-search ranking structure.
    pub max_ranked_entries: usize,

    /// Fan-out clamp: fewest peers asked per global query.
    pub min_fanout_peers: usize,

    /// Fan-out clamp: most peers asked per global query.
    pub max_fanout_peers: usize,

    /// Milliseconds of budget per additional fan-out peer.
    pub fanout_ms_per_peer: u64,

    /// Secondary-search dedup rule: skip a peer's contribution for a
    /// document it already contributed under another word.
    pub skip_repeated_contributions: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_ranked_entries: 1000,
            min_fanout_peers: 30,
            max_fanout_peers: 50,
            fanout_ms_per_peer: 500,
            skip_repeated_contributions: true,
        }
    }
}

/// Counters reported alongside every result sequence.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    /// Postings contributed by the local index.
    pub local_count: usize,

    /// Postings contributed by remote peers.
    pub global_count: usize,

    /// Postings rejected by constraint or content-domain filters.
    pub filtered_count: usize,

    /// Peers that answered the primary fan-out.
    pub remote_peer_count: usize,

    /// Peers asked in the secondary round.
    pub secondary_peer_count: usize,

    /// Documents whose records could not be resolved.
    pub miss_count: usize,
}

/// The search engine: orchestrates queries over one tiered index and one
/// peer transport.
pub struct SearchEngine {
    index: Arc<TieredWordIndex>,
    store: Arc<dyn DocumentStore>,
    transport: Arc<dyn PeerTransport>,
    config: SearchConfig,
    pool: rayon::ThreadPool,
    /// Serializes the local collection scan across concurrent searches.
    local_phase: Mutex<()>,
}

impl SearchEngine {
    pub fn new(
        index: Arc<TieredWordIndex>,
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn PeerTransport>,
        config: SearchConfig,
    ) -> Result<Self> {
        // fan-out tasks block on network I/O, so the pool is sized well
        // past the core count
        let threads = config.max_fanout_peers.max(num_cpus::get());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|n| format!("search-remote-{n}"))
            .build()
            .map_err(|e| crate::error::NeritaError::query(format!("search pool: {e}")))?;
        Ok(SearchEngine {
            index,
            store,
            transport,
            config,
            pool,
            local_phase: Mutex::new(()),
        })
    }

    /// Execute one query within its time budget. Returns the ordered,
    /// deduplicated, diversity-filtered results and the phase counters.
    pub fn search(
        &self,
        query: Query,
        profile: RankingProfile,
    ) -> Result<(Vec<SearchResultEntry>, SearchStats)> {
        let event_id = uuid::Uuid::new_v4();
        let started = Instant::now();
        let budget = query.time_budget;
        let mut stats = SearchStats::default();
        debug!(
            "search {event_id} started: {} include / {} exclude words, budget {budget:?}",
            query.include.len(),
            query.exclude.len()
        );

        // remote fan-out starts first so it overlaps local retrieval
        let cancelled = Arc::new(AtomicBool::new(false));
        let primary_rx = if query.scope == SearchScope::Global {
            Some(self.spawn_primary_searches(&query, budget, &cancelled))
        } else {
            None
        };

        let local = {
            let _guard = self.local_phase.lock();
            self.local_join(&query, started)?
        };

        let mut process = RankingProcess::new(
            query.clone(),
            profile,
            Arc::clone(&self.store),
            self.config.max_ranked_entries,
        );
        if let Some(container) = &local {
            process.insert(container, true);
        }

        let mut learned: Vec<Container> = Vec::new();
        if let Some((peer_count, rx)) = primary_rx {
            let primary_deadline = started + budget.mul_f64(2.0 / 3.0);
            let responses = collect_until(rx, peer_count, primary_deadline);
            cancelled.store(true, Ordering::Release);
            stats.remote_peer_count = responses.len();

            let mut abstracts: IndexAbstract = BTreeMap::new();
            for (_, result) in &responses {
                for container in &result.containers {
                    process.insert(container, false);
                    learned.push(container.clone());
                }
                for (word, docs) in &result.abstracts {
                    let merged = abstracts.entry(*word).or_default();
                    for (doc, peers) in docs {
                        merged.entry(*doc).or_default().extend(peers.iter().copied());
                    }
                }
            }

            let secondary = self.secondary_search(&query, &abstracts, started, budget);
            stats.secondary_peer_count = secondary.0;
            for container in secondary.1 {
                process.insert(&container, false);
                learned.push(container);
            }
        }

        let mut results = Vec::with_capacity(query.wanted_results);
        while results.len() < query.wanted_results {
            let Some(entry) = process.best_result(true) else {
                break;
            };
            process.add_topics(&[entry.record.title.clone()]);
            results.push(entry);
        }

        stats.local_count = process.local_count();
        stats.global_count = process.remote_count();
        stats.filtered_count = process.filtered_count();
        stats.miss_count = process.miss_count();

        self.flush_back(learned);
        info!(
            "search {event_id} finished in {:?}: {} results, {} local / {} remote postings, {} peers",
            started.elapsed(),
            results.len(),
            stats.local_count,
            stats.global_count,
            stats.remote_peer_count
        );
        Ok((results, stats))
    }

    /// Phase 1: fetch include and exclude containers from the local index,
    /// each time-boxed to its share of the budget, and compute the
    /// conjunctive join. An incomplete include fetch means no local match.
    fn local_join(&self, query: &Query, started: Instant) -> Result<Option<Container>> {
        if query.include.is_empty() {
            return Ok(None);
        }
        let budget = query.time_budget;
        let total_words = query.include.len() + query.exclude.len();
        let include_share = query.include.len() as f64 / total_words as f64;
        let include_deadline = started + budget.mul_f64(include_share);

        let mut include_containers = Vec::with_capacity(query.include.len());
        for word in &query.include {
            if Instant::now() > include_deadline {
                debug!("local include fetch timed out, treating as no match");
                return Ok(None);
            }
            match self.index.lookup(word)? {
                Some(container) if !container.is_empty() => include_containers.push(container),
                // conjunctive semantics: one empty include word empties the join
                _ => return Ok(None),
            }
        }

        let mut excluded: BTreeSet<DocHash> = BTreeSet::new();
        for word in &query.exclude {
            if Instant::now() > started + budget {
                break;
            }
            if let Some(container) = self.index.lookup(word)? {
                excluded.extend(container.doc_hashes().copied());
            }
        }

        Ok(join_conjunctive(&include_containers, &excluded, query.max_distance))
    }

    /// Phase 2 launch: one task per target peer, each with its own
    /// deadline. Returns the peer count and the result channel.
    fn spawn_primary_searches(
        &self,
        query: &Query,
        budget: Duration,
        cancelled: &Arc<AtomicBool>,
    ) -> (usize, mpsc::Receiver<(Peer, Result<RemoteSearchResult>)>) {
        let fanout = (budget.as_millis() as u64 / self.config.fanout_ms_per_peer.max(1))
            .clamp(self.config.min_fanout_peers as u64, self.config.max_fanout_peers as u64)
            as usize;
        let anchor = query
            .include
            .iter()
            .next()
            .copied()
            .unwrap_or(WordHash::MIN);
        let peers: Vec<Peer> = self
            .transport
            .eligible_peers_by_distance(&anchor)
            .into_iter()
            .take(fanout)
            .collect();
        debug!("primary fan-out to {} peers (budget {budget:?})", peers.len());

        let (tx, rx) = mpsc::channel();
        let count = peers.len();
        for peer in peers {
            let tx = tx.clone();
            let transport = Arc::clone(&self.transport);
            let include = query.include.clone();
            let exclude = query.exclude.clone();
            let constraint = query.constraint;
            let cancelled = Arc::clone(cancelled);
            let timeout = budget.mul_f64(2.0 / 3.0);
            self.pool.spawn(move || {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let result = transport.query_remote(&peer, &include, &exclude, constraint, timeout);
                let _ = tx.send((peer, result));
            });
        }
        (count, rx)
    }

    /// Phase 3: constructive join over the collected abstracts, then a
    /// narrow second round against the contributing peers. Returns the
    /// number of peers asked and the recovered containers.
    fn secondary_search(
        &self,
        query: &Query,
        abstracts: &IndexAbstract,
        started: Instant,
        budget: Duration,
    ) -> (usize, Vec<Container>) {
        // abstracts for every queried word are required for the join
        if query.include.iter().any(|w| !abstracts.contains_key(w)) {
            return (0, Vec::new());
        }

        // documents every word knows a contributor for
        let mut candidates: Option<BTreeSet<DocHash>> = None;
        for word in &query.include {
            let docs: BTreeSet<DocHash> = abstracts[word].keys().copied().collect();
            candidates = Some(match candidates {
                Some(set) => set.intersection(&docs).copied().collect(),
                None => docs,
            });
        }
        let candidates = candidates.unwrap_or_default();
        if candidates.is_empty() {
            return (0, Vec::new());
        }

        // group candidates by contributing peer, applying the repeated-
        // contribution dedup rule
        let mut per_peer: BTreeMap<crate::dht::PeerId, BTreeSet<DocHash>> = BTreeMap::new();
        let mut contributed: BTreeSet<(crate::dht::PeerId, DocHash)> = BTreeSet::new();
        for word in &query.include {
            for (doc, peers) in &abstracts[word] {
                if !candidates.contains(doc) {
                    continue;
                }
                for peer in peers {
                    if self.config.skip_repeated_contributions
                        && !contributed.insert((*peer, *doc))
                    {
                        continue;
                    }
                    per_peer.entry(*peer).or_default().insert(*doc);
                }
            }
        }

        let deadline = started + budget;
        let words = query.include.clone();
        let (tx, rx) = mpsc::channel();
        let mut asked = 0usize;
        for (peer_id, docs) in per_peer {
            let Some(peer) = self
                .transport
                .eligible_peers_by_distance(&WordHash(peer_id.0))
                .into_iter()
                .find(|p| p.id == peer_id)
            else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            asked += 1;
            let tx = tx.clone();
            let transport = Arc::clone(&self.transport);
            let words = words.clone();
            self.pool.spawn(move || {
                let result = transport.query_secondary(&peer, &words, &docs, remaining);
                let _ = tx.send((peer, result));
            });
        }
        drop(tx);

        let mut recovered = Vec::new();
        let responses = collect_until(rx, asked, deadline);
        for (peer, result) in responses {
            debug!("secondary response from {} with {} containers", peer.id, result.len());
            recovered.extend(result);
        }
        (asked, recovered)
    }

    /// Phase 5: push remotely learned postings into the local index from a
    /// detached task, independent of the caller's deadline.
    fn flush_back(&self, learned: Vec<Container>) {
        if learned.is_empty() {
            return;
        }
        let index = Arc::clone(&self.index);
        let spawned = thread::Builder::new()
            .name("search-flush".to_string())
            .spawn(move || {
                let now = now_millis();
                for container in learned {
                    let word = container.word();
                    if let Err(e) = index.insert(container, now) {
                        warn!("flush-back of {word} failed: {e}");
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("cannot spawn flush-back task: {e}");
        }
    }
}

/// Drain up to `expected` successful responses from a channel until the
/// deadline. Failed responses are dropped; late ones are abandoned.
fn collect_until<T>(
    rx: mpsc::Receiver<(Peer, Result<T>)>,
    expected: usize,
    deadline: Instant,
) -> Vec<(Peer, T)> {
    let mut out = Vec::new();
    let mut received = 0usize;
    while received < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("phase deadline elapsed with {received}/{expected} responses");
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok((peer, Ok(value))) => {
                received += 1;
                out.push((peer, value));
            }
            Ok((peer, Err(e))) => {
                received += 1;
                debug!("peer {} failed: {e}", peer.id);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    out
}

/// Intersect include containers, subtract excluded documents, and apply
/// the positional proximity constraint. The representative posting of each
/// surviving document comes from the first container.
fn join_conjunctive(
    includes: &[Container],
    excluded: &BTreeSet<DocHash>,
    max_distance: Option<u32>,
) -> Option<Container> {
    let first = includes.first()?;
    let mut joined = Container::new(first.word());

    'docs: for posting in first.postings() {
        if excluded.contains(&posting.doc) {
            continue;
        }
        let mut min_pos = posting.pos_in_text;
        let mut max_pos = posting.pos_in_text;
        for other in &includes[1..] {
            let Some(other_posting) = other.get(&posting.doc) else {
                continue 'docs;
            };
            min_pos = min_pos.min(other_posting.pos_in_text);
            max_pos = max_pos.max(other_posting.pos_in_text);
        }
        if let Some(limit) = max_distance {
            if max_pos - min_pos > limit {
                continue;
            }
        }
        joined.add(*posting);
    }

    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Build the index abstracts a peer ships with its primary search
/// response: for each queried word, the documents this peer holds postings
/// for, attributed to itself. Exposed so transports answering remote
/// queries can produce the same shape the engine consumes.
pub fn build_abstract(
    own: crate::dht::PeerId,
    words: &BTreeSet<WordHash>,
    lookup: impl Fn(&WordHash) -> Option<Vec<Posting>>,
) -> IndexAbstract {
    let mut abstracts: IndexAbstract = BTreeMap::new();
    for word in words {
        let entry = abstracts.entry(*word).or_default();
        if let Some(postings) = lookup(word) {
            for posting in postings {
                entry.entry(posting.doc).or_default().push(own);
            }
        }
    }
    abstracts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(n: usize) -> DocHash {
        DocHash::from_url(&format!("http://s{n}.net/p"), &format!("s{n}.net"))
    }

    fn container(word: &str, postings: &[(DocHash, u32)]) -> Container {
        let mut c = Container::new(WordHash::from_word(word));
        for &(d, pos) in postings {
            c.add(Posting::new(d, pos, 10));
        }
        c
    }

    #[test]
    fn test_join_intersects_and_excludes() {
        let cat = container("cat", &[(doc(1), 1), (doc(2), 1), (doc(3), 1)]);
        let dog = container("dog", &[(doc(1), 2), (doc(3), 2)]);
        let excluded: BTreeSet<DocHash> = [doc(3)].into_iter().collect();

        let joined = join_conjunctive(&[cat, dog], &excluded, None).unwrap();
        assert_eq!(joined.len(), 1);
        assert!(joined.contains(&doc(1)));
    }

    #[test]
    fn test_join_honors_max_distance() {
        let cat = container("cat", &[(doc(1), 1), (doc(2), 1)]);
        let dog = container("dog", &[(doc(1), 5), (doc(2), 100)]);

        let joined = join_conjunctive(&[cat, dog], &BTreeSet::new(), Some(10)).unwrap();
        assert!(joined.contains(&doc(1)));
        assert!(!joined.contains(&doc(2)));
    }

    #[test]
    fn test_join_of_disjoint_containers_is_none() {
        let cat = container("cat", &[(doc(1), 1)]);
        let dog = container("dog", &[(doc(2), 1)]);
        assert!(join_conjunctive(&[cat, dog], &BTreeSet::new(), None).is_none());
    }

    #[test]
    fn test_build_abstract_attributes_own_postings() {
        let own = crate::dht::PeerId([b'a'; crate::index::HASH_LEN]);
        let words: BTreeSet<WordHash> =
            [WordHash::from_word("cat"), WordHash::from_word("dog")].into_iter().collect();
        let cat = container("cat", &[(doc(1), 1)]);

        let abstracts = build_abstract(own, &words, |w| {
            (*w == cat.word()).then(|| cat.postings().copied().collect())
        });
        assert_eq!(abstracts.len(), 2);
        assert_eq!(abstracts[&cat.word()][&doc(1)], vec![own]);
        assert!(abstracts[&WordHash::from_word("dog")].is_empty());
    }
}
