//! Index distribution: pushing chunks of the local index to the peers that
//! are responsible for them on the keyspace circle.
//!
//! Local deletion is conditional on quorum: a chunk's postings leave the
//! local index only after `peer_count` peers have acknowledged the
//! transfer. Anything less leaves the local index untouched and the chunk
//! eligible for re-selection on a later pass.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::cache::TieredWordIndex;
use crate::dht::chunk::{ChunkSelector, DhtChunk};
use crate::dht::transport::{dht_distance, Peer, PeerTransport};
use crate::error::{NeritaError, Result};
use crate::index::{DocHash, WordHash};

/// Configuration for the distributor.
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Hard cap on the acceptable peer distance, as a fraction of the
    /// keyspace.
    pub max_distance: f64,

    /// Extra candidates accepted beyond `peer_count`, as failover targets.
    pub reserve_peers: usize,

    /// Lower clamp of the adaptive chunk size.
    pub min_index_count: usize,

    /// Initial adaptive chunk size.
    pub initial_index_count: usize,

    /// Per-transfer time target driving the chunk-size adaptation.
    pub max_time_per_transfer: Duration,

    /// Network timeout of a single transfer call.
    pub transfer_timeout: Duration,

    /// Compress transfer payloads.
    pub gzip: bool,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            max_distance: 0.4,
            reserve_peers: 1,
            min_index_count: 50,
            initial_index_count: 500,
            max_time_per_transfer: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
            gzip: true,
        }
    }
}

struct FullDistributionJob {
    handle: thread::JoinHandle<()>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
}

/// Distributes index chunks to DHT-responsible peers.
pub struct IndexDistributor {
    index: Arc<TieredWordIndex>,
    selector: Arc<ChunkSelector>,
    transport: Arc<dyn PeerTransport>,
    config: DistributionConfig,
    index_count: AtomicUsize,
    full_job: Mutex<Option<FullDistributionJob>>,
}

impl IndexDistributor {
    pub fn new(
        index: Arc<TieredWordIndex>,
        selector: Arc<ChunkSelector>,
        transport: Arc<dyn PeerTransport>,
        config: DistributionConfig,
    ) -> Self {
        let initial = config.initial_index_count.max(config.min_index_count);
        IndexDistributor {
            index,
            selector,
            transport,
            config,
            index_count: AtomicUsize::new(initial),
            full_job: Mutex::new(None),
        }
    }

    /// Current adaptive chunk size.
    pub fn index_count(&self) -> usize {
        self.index_count.load(Ordering::Relaxed)
    }

    /// One distribution pass: select a chunk of up to `index_count`
    /// postings at the rotating cursor, transfer it to `peer_count` peers,
    /// delete it locally on quorum. `index_count` seeds the adaptive chunk
    /// size for subsequent passes; callers that want the adaptation to
    /// carry over pass [`IndexDistributor::index_count`] back in. Returns
    /// the number of postings transferred and deleted.
    pub fn distribute_once(&self, index_count: usize, peer_count: usize) -> Result<usize> {
        if peer_count == 0 {
            return Err(NeritaError::distribution("peer count must be positive"));
        }
        let started = Instant::now();
        let index_count = index_count.max(self.config.min_index_count);
        self.index_count.store(index_count, Ordering::Relaxed);

        let Some(chunk) = self.selector.select(index_count)? else {
            debug!("nothing to distribute");
            return Ok(0);
        };

        let transferred = self.transfer_chunk(&chunk, peer_count)?;
        self.delete_chunk(&chunk);
        self.adapt_index_count(started.elapsed(), peer_count);
        Ok(transferred)
    }

    /// Transfer a chunk to `peer_count` peers, trying failover candidates
    /// on per-peer errors. Returns the posting count on quorum; an error
    /// otherwise. Never mutates the local index.
    fn transfer_chunk(&self, chunk: &DhtChunk, peer_count: usize) -> Result<usize> {
        let own = self.transport.own_id();
        let own_distance = dht_distance(&own, &chunk.first());
        let max_distance = own_distance.min(self.config.max_distance);

        let candidates: Vec<Peer> = self
            .transport
            .eligible_peers_by_distance(&chunk.first())
            .into_iter()
            .filter(|p| dht_distance(&p.id, &chunk.first()) < max_distance)
            .take(peer_count + self.config.reserve_peers)
            .collect();

        if candidates.len() < peer_count {
            return Err(NeritaError::distribution(format!(
                "insufficient eligible peers: {} of {} within distance {:.3}",
                candidates.len(),
                peer_count,
                max_distance
            )));
        }

        let mut successes = 0usize;
        for peer in &candidates {
            if successes >= peer_count {
                break;
            }
            match self
                .transport
                .transfer_index(peer, chunk, self.config.gzip, self.config.transfer_timeout)
            {
                Ok(()) => {
                    debug!("transferred chunk {}..{} to {}", chunk.first(), chunk.last(), peer.id);
                    successes += 1;
                }
                Err(e) => {
                    warn!("transfer to {} failed, marking departed: {e}", peer.id);
                    self.transport.mark_departed(peer);
                }
            }
        }

        if successes < peer_count {
            return Err(NeritaError::distribution(format!(
                "quorum not reached: {successes} of {peer_count} transfers succeeded"
            )));
        }
        Ok(chunk.posting_count())
    }

    /// Delete a successfully transferred chunk from the local index.
    /// Deletion errors after quorum are a data-repair condition, logged and
    /// not propagated.
    fn delete_chunk(&self, chunk: &DhtChunk) {
        for container in chunk.containers() {
            let docs: Vec<DocHash> = container.doc_hashes().copied().collect();
            if let Err(e) = self.index.remove_documents(&container.word(), &docs) {
                error!(
                    "local deletion of {} after quorum failed, index needs repair: {e}",
                    container.word()
                );
            }
        }
        info!(
            "distributed and deleted chunk {}..{} ({} postings)",
            chunk.first(),
            chunk.last(),
            chunk.posting_count()
        );
    }

    fn adapt_index_count(&self, elapsed: Duration, peer_count: usize) {
        let budget = self.config.max_time_per_transfer * peer_count as u32;
        let current = self.index_count.load(Ordering::Relaxed);
        let next = if elapsed > budget {
            current / 2
        } else {
            current + current / 10 + 1
        };
        let next = next.max(self.config.min_index_count);
        if next != current {
            debug!("adaptive chunk size {current} -> {next} (attempt took {elapsed:?})");
            self.index_count.store(next, Ordering::Relaxed);
        }
    }

    /// Start a background job that walks the whole keyspace once, pushing
    /// every container to `target`. While one chunk is in flight the next
    /// is already being selected; a chunk's postings are deleted only after
    /// its transfer worker reports success (and only when `delete_local`).
    pub fn start_full_distribution(self: &Arc<Self>, target: Peer, delete_local: bool) -> Result<()> {
        let mut slot = self.full_job.lock();
        if slot.is_some() {
            return Err(NeritaError::distribution("full distribution already running"));
        }

        let running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let aborted = Arc::new(AtomicBool::new(false));

        let distributor = Arc::clone(self);
        let flags = (Arc::clone(&running), Arc::clone(&paused), Arc::clone(&aborted));
        let handle = thread::Builder::new()
            .name("full-distribution".to_string())
            .spawn(move || {
                distributor.full_distribution_loop(target, delete_local, flags.0, flags.1, flags.2);
            })?;

        *slot = Some(FullDistributionJob {
            handle,
            running,
            paused,
            aborted,
        });
        Ok(())
    }

    /// True while the full-distribution job is running.
    pub fn is_distributing(&self) -> bool {
        self.full_job.lock().is_some()
    }

    /// Suspend the full-distribution job after its current chunk.
    pub fn pause_full_distribution(&self) {
        if let Some(job) = self.full_job.lock().as_ref() {
            job.paused.store(true, Ordering::Release);
        }
    }

    /// Resume a paused full-distribution job.
    pub fn resume_full_distribution(&self) {
        if let Some(job) = self.full_job.lock().as_ref() {
            job.paused.store(false, Ordering::Release);
        }
    }

    /// Stop the full-distribution job gracefully, joining outstanding work.
    pub fn stop_full_distribution(&self) {
        let job = self.full_job.lock().take();
        if let Some(job) = job {
            job.running.store(false, Ordering::Release);
            let _ = job.handle.join();
        }
    }

    /// Abort the full-distribution job: discard in-flight work immediately,
    /// without waiting for it and without deleting its chunk.
    pub fn abort_full_distribution(&self) {
        let job = self.full_job.lock().take();
        if let Some(job) = job {
            job.aborted.store(true, Ordering::Release);
            job.running.store(false, Ordering::Release);
            // detached: the worker notices the flags at its next checkpoint
            // and exits without deleting; its result send into the bounded
            // channel never blocks, so nothing is left hanging
            drop(job.handle);
        }
    }

    fn full_distribution_loop(
        &self,
        target: Peer,
        delete_local: bool,
        running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
    ) {
        let mut cursor = WordHash::MIN;
        let mut in_flight: Option<(DhtChunk, Receiver<Result<()>>, Instant)> = None;
        let mut index_count = self.index_count.load(Ordering::Relaxed);
        let mut transferred_total = 0usize;

        info!("full distribution to {} started", target.id);
        loop {
            while paused.load(Ordering::Acquire) && running.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(100));
            }
            if !running.load(Ordering::Acquire) {
                break;
            }

            // select the next chunk while the previous one is in flight
            let select_started = Instant::now();
            let next = match self.selector.select_from(&cursor, index_count) {
                Ok(next) => next,
                Err(e) => {
                    error!("chunk selection failed, stopping full distribution: {e}");
                    break;
                }
            };
            let select_time = select_started.elapsed();

            // join the in-flight transfer before touching its postings
            if let Some((chunk, receiver, transfer_started)) = in_flight.take() {
                match receiver.recv() {
                    Ok(Ok(())) => {
                        if aborted.load(Ordering::Acquire) {
                            break;
                        }
                        transferred_total += chunk.posting_count();
                        if delete_local {
                            self.delete_chunk(&chunk);
                        }
                        // shrink when the transfer is the bottleneck, grow
                        // when the selection is
                        let transfer_time = transfer_started.elapsed();
                        index_count = if transfer_time > select_time.max(Duration::from_millis(1)) * 2 {
                            (index_count / 2).max(self.config.min_index_count)
                        } else {
                            index_count + index_count / 10 + 1
                        };
                    }
                    Ok(Err(e)) => {
                        warn!("transfer to {} failed, stopping full distribution: {e}", target.id);
                        self.transport.mark_departed(&target);
                        break;
                    }
                    Err(_) => {
                        error!("transfer worker vanished, stopping full distribution");
                        break;
                    }
                }
            }
            if !running.load(Ordering::Acquire) {
                break;
            }

            let Some((chunk, next_cursor)) = next else {
                break; // keyspace exhausted
            };
            // never re-read a word whose chunk is still in flight: a
            // partially taken word keeps its remainder local until the
            // next pass
            cursor = if next_cursor == chunk.last() {
                crate::dht::chunk::successor(&chunk.last()).unwrap_or(WordHash::MAX)
            } else {
                next_cursor
            };

            let transfer_started = Instant::now();
            let (sender, receiver) = bounded(1);
            let transport = Arc::clone(&self.transport);
            let peer = target.clone();
            let gzip = self.config.gzip;
            let timeout = self.config.transfer_timeout;
            let worker_chunk = chunk.clone();
            let spawned = thread::Builder::new()
                .name("distribution-transfer".to_string())
                .spawn(move || {
                    let _ = sender.send(transport.transfer_index(&peer, &worker_chunk, gzip, timeout));
                });
            if let Err(e) = spawned {
                error!("cannot spawn transfer worker: {e}");
                break;
            }
            in_flight = Some((chunk, receiver, transfer_started));
        }

        // a graceful stop still joins the outstanding worker; an abort
        // discards it
        if let Some((chunk, receiver, _)) = in_flight.take() {
            if !aborted.load(Ordering::Acquire) {
                if let Ok(Ok(())) = receiver.recv() {
                    transferred_total += chunk.posting_count();
                    if delete_local {
                        self.delete_chunk(&chunk);
                    }
                }
            }
        }

        info!("full distribution to {} finished, {transferred_total} postings transferred", target.id);
    }
}
