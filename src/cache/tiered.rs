//! The tiered word index: RAM cache, assortment mid tier, persistent
//! backend, with a background eviction task.
//!
//! Reads force-flush the RAM and assortment entries for the requested word
//! into the backend before reading from it, so a reader never sees two tier
//! versions of the same word at once. This trades read latency for a single
//! source of truth and is a deliberate property of the engine.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::cache::assortment::AssortmentCluster;
use crate::cache::dump::{DumpReader, DumpRow, DumpWriter};
use crate::cache::now_millis;
use crate::error::Result;
use crate::index::{Container, DocHash, WordHash};
use crate::store::WordStore;

/// File name of the RAM cache dump inside the data directory.
const INDEX_DUMP_FILE: &str = "indexCache.dump";

/// File name of the assortment tier dump inside the data directory.
const ASSORTMENT_DUMP_FILE: &str = "assortments.dump";

/// Configuration for the tiered word index.
///
/// The thresholds are empirically tuned values carried over from the
/// production system; they are configuration, not inferred semantics.
#[derive(Debug, Clone)]
pub struct TieredIndexConfig {
    /// Maximum number of distinct words in the RAM cache, enforced before
    /// insert.
    pub max_words: usize,

    /// Hit-count above which an entry is flushed regardless of age.
    pub ram_cache_limit: usize,

    /// Largest container size the assortment tier accepts; also the
    /// hit-count bound of the aged-entry flush rule.
    pub assortment_limit: usize,

    /// Containers per assortment size class.
    pub assortment_slots: usize,

    /// Age bound of the aged-entry flush rule.
    pub max_entry_age: Duration,

    /// Proactive eviction threshold: total postings held in RAM.
    pub max_postings_in_ram: usize,

    /// Flush task sleep when the cache is full.
    pub min_flush_sleep: Duration,

    /// Flush task sleep when the cache is empty.
    pub max_flush_sleep: Duration,
}

impl Default for TieredIndexConfig {
    fn default() -> Self {
        TieredIndexConfig {
            max_words: 10_000,
            ram_cache_limit: 200,
            assortment_limit: 50,
            assortment_slots: 1024,
            max_entry_age: Duration::from_millis(10_000),
            max_postings_in_ram: 300_000,
            min_flush_sleep: Duration::from_millis(50),
            max_flush_sleep: Duration::from_secs(5),
        }
    }
}

/// One RAM cache slot: the container together with its eviction score.
/// Keeping the score inside the entry avoids parallel score structures
/// that would have to be kept in sync manually.
#[derive(Debug)]
struct CacheEntry {
    container: Container,
    hit_count: usize,
    last_seen: u64,
}

#[derive(Debug)]
struct CacheState {
    ram: BTreeMap<WordHash, CacheEntry>,
    ram_postings: usize,
    assortments: AssortmentCluster,
}

/// Pause/resume protocol between foreground operations and the background
/// flush task. Foreground operations that need a non-shrinking view across
/// several lock acquisitions hold a pause guard; the flush task waits on
/// the condvar instead of polling.
#[derive(Debug, Default)]
struct FlushControl {
    pauses: Mutex<usize>,
    resumed: Condvar,
}

/// RAII guard suspending the background flush task.
pub struct FlushPause<'a> {
    control: &'a FlushControl,
}

impl Drop for FlushPause<'_> {
    fn drop(&mut self) {
        let mut pauses = self.control.pauses.lock();
        *pauses = pauses.saturating_sub(1);
        self.control.resumed.notify_all();
    }
}

struct Shared {
    state: Mutex<CacheState>,
    backend: Arc<dyn WordStore>,
    config: TieredIndexConfig,
    running: AtomicBool,
    control: FlushControl,
}

/// The tiered word index.
pub struct TieredWordIndex {
    shared: Arc<Shared>,
    data_dir: PathBuf,
    flush_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for TieredWordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredWordIndex")
            .field("data_dir", &self.data_dir)
            .field("ram_size", &self.ram_size())
            .finish()
    }
}

impl TieredWordIndex {
    /// Open the index: restore persisted dumps from `data_dir` and start
    /// the background flush task. A corrupted dump aborts the startup.
    pub fn open(
        data_dir: &Path,
        backend: Arc<dyn WordStore>,
        config: TieredIndexConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                ram: BTreeMap::new(),
                ram_postings: 0,
                assortments: AssortmentCluster::new(config.assortment_limit, config.assortment_slots),
            }),
            backend,
            config,
            running: AtomicBool::new(true),
            control: FlushControl::default(),
        });

        let index = TieredWordIndex {
            shared: Arc::clone(&shared),
            data_dir: data_dir.to_path_buf(),
            flush_handle: Mutex::new(None),
        };

        index.restore()?;

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("index-flush".to_string())
            .spawn(move || flush_loop(worker_shared))?;
        *index.flush_handle.lock() = Some(handle);

        Ok(index)
    }

    /// Merge a container into the cache. When the RAM cache is at its word
    /// bound, or total RAM postings exceed the pressure threshold, the
    /// eviction routine runs first. Returns the number of postings actually
    /// added after deduplication.
    pub fn insert(&self, container: Container, update_time: u64) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let word = container.word();

        if !state.ram.contains_key(&word) {
            let mut attempts = 0;
            while state.ram.len() >= shared.config.max_words {
                if !shared.flush_one(&mut state) {
                    warn!("cache eviction made no progress at {} words", state.ram.len());
                    break;
                }
                attempts += 1;
                if attempts >= 64 {
                    break;
                }
            }
        }
        while state.ram_postings > shared.config.max_postings_in_ram {
            if !shared.flush_one(&mut state) {
                break;
            }
        }

        let entry = state
            .ram
            .entry(word)
            .or_insert_with(|| CacheEntry {
                container: Container::new(word),
                hit_count: 0,
                last_seen: update_time,
            });
        let before = entry.container.len();
        let merged = entry.container.merge(&container);
        entry.container.set_last_update(update_time);
        let added = entry.container.len() - before;
        if merged > 0 {
            entry.hit_count += added;
            entry.last_seen = update_time;
        }
        state.ram_postings += added;
        Ok(added)
    }

    /// Read the container for a word. The RAM and assortment entries for
    /// the word are force-flushed into the backend first, then the backend
    /// is read: one consistent source of truth per read.
    pub fn lookup(&self, word: &WordHash) -> Result<Option<Container>> {
        let _pause = self.pause_flushing();
        self.shared.flush_word_to_backend(word)?;
        self.shared.backend.get(word)
    }

    /// Remove a word from all tiers.
    pub fn remove(&self, word: &WordHash) -> Result<bool> {
        let _pause = self.pause_flushing();
        self.shared.flush_word_to_backend(word)?;
        self.shared.backend.delete(word)
    }

    /// Remove specific document postings from a word, across all tiers.
    /// Returns the number of postings removed.
    pub fn remove_documents(&self, word: &WordHash, docs: &[DocHash]) -> Result<usize> {
        let _pause = self.pause_flushing();
        self.shared.flush_word_to_backend(word)?;
        self.shared.backend.remove_documents(word, docs)
    }

    /// Upper bound of the number of distinct words in the index. The tiers
    /// overlap at flush boundaries, so the largest tier is reported.
    pub fn size(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .ram
            .len()
            .max(state.assortments.word_count())
            .max(self.shared.backend.len())
    }

    /// Number of distinct words currently held in RAM.
    pub fn ram_size(&self) -> usize {
        self.shared.state.lock().ram.len()
    }

    /// Highest hit-count score currently in the RAM cache.
    pub fn max_hit_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.ram.values().map(|e| e.hit_count).max().unwrap_or(0)
    }

    /// Entry counts per assortment size class.
    pub fn assortment_sizes(&self) -> Vec<usize> {
        self.shared.state.lock().assortments.class_sizes()
    }

    /// Lazily merged ascending word-hash sequence over all three tiers,
    /// without duplicates, starting at `start` (inclusive).
    pub fn word_hashes_from(&self, start: &WordHash) -> Result<Box<dyn Iterator<Item = WordHash> + Send>> {
        let (ram_keys, assortment_keys) = {
            let state = self.shared.state.lock();
            let ram: Vec<WordHash> = state.ram.range(*start..).map(|(k, _)| *k).collect();
            let assorted: Vec<WordHash> = state
                .assortments
                .word_hashes()
                .into_iter()
                .filter(|k| k >= start)
                .collect();
            (ram, assorted)
        };
        let backend_keys = self.shared.backend.iterate_from(start)?;
        let cached = MergeAscending::new(ram_keys.into_iter(), assortment_keys.into_iter());
        Ok(Box::new(MergeAscending::new(cached, backend_keys)))
    }

    /// Suspend the background flush task for the lifetime of the guard.
    pub fn pause_flushing(&self) -> FlushPause<'_> {
        let mut pauses = self.shared.control.pauses.lock();
        *pauses += 1;
        FlushPause {
            control: &self.shared.control,
        }
    }

    /// Stop the flush task and persist the RAM and assortment tiers so
    /// they can be replayed on the next start.
    pub fn close(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.control.resumed.notify_all();
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
        self.dump()
    }

    fn dump(&self) -> Result<()> {
        let mut state = self.shared.state.lock();

        let mut writer = DumpWriter::create(&self.data_dir.join(INDEX_DUMP_FILE))?;
        // descending hash order; restore order is not significant
        for (word, entry) in state.ram.iter().rev() {
            for posting in entry.container.postings() {
                writer.write_row(&DumpRow {
                    word: *word,
                    container_size: entry.container.len() as u32,
                    update_time: entry.container.last_update(),
                    doc: posting.doc,
                    posting: *posting,
                })?;
            }
        }
        let rows = writer.finish()?;
        info!("dumped {} words ({rows} postings) from RAM cache", state.ram.len());

        let mut writer = DumpWriter::create(&self.data_dir.join(ASSORTMENT_DUMP_FILE))?;
        let mut rows = 0u64;
        for container in state.assortments.drain() {
            for posting in container.postings() {
                writer.write_row(&DumpRow {
                    word: container.word(),
                    container_size: container.len() as u32,
                    update_time: container.last_update(),
                    doc: posting.doc,
                    posting: *posting,
                })?;
                rows += 1;
            }
        }
        writer.finish()?;
        info!("dumped {rows} assortment postings");
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let assortment_path = self.data_dir.join(ASSORTMENT_DUMP_FILE);
        if assortment_path.exists() {
            let mut restored = 0u64;
            let mut pending: Option<Container> = None;
            for row in DumpReader::open(&assortment_path)? {
                let row = row?;
                restored += 1;
                match pending.as_mut() {
                    Some(c) if c.word() == row.word => {
                        c.add(row.posting);
                    }
                    _ => {
                        if let Some(full) = pending.take() {
                            self.shared.absorb_restored(full)?;
                        }
                        let mut c = Container::with_posting(row.word, row.posting, row.update_time);
                        c.set_last_update(row.update_time);
                        pending = Some(c);
                    }
                }
            }
            if let Some(full) = pending.take() {
                self.shared.absorb_restored(full)?;
            }
            info!("restored {restored} assortment postings");
        }

        let dump_path = self.data_dir.join(INDEX_DUMP_FILE);
        if dump_path.exists() {
            let mut restored = 0u64;
            for row in DumpReader::open(&dump_path)? {
                let row = row?;
                // replaying through insert keeps the cache bound: eviction
                // triggers mid-replay under pressure
                self.insert(
                    Container::with_posting(row.word, row.posting, row.update_time),
                    row.update_time,
                )?;
                restored += 1;
            }
            info!("restored {restored} postings into RAM cache");
        }
        Ok(())
    }
}

impl Shared {
    /// Move the RAM and assortment entries for one word into the backend.
    /// On backend failure the data is put back into RAM; the cache remains
    /// the durable source until a flush succeeds.
    fn flush_word_to_backend(&self, word: &WordHash) -> Result<()> {
        let mut state = self.state.lock();
        let mut merged: Option<Container> = None;
        if let Some(entry) = state.ram.remove(word) {
            state.ram_postings = state.ram_postings.saturating_sub(entry.container.len());
            merged = Some(entry.container);
        }
        if let Some(piece) = state.assortments.take(word) {
            match merged.as_mut() {
                Some(m) => {
                    m.merge(&piece);
                }
                None => merged = Some(piece),
            }
        }
        let Some(container) = merged else {
            return Ok(());
        };
        if let Err(e) = self.backend.put(container.clone()) {
            warn!("flush of {word} to backend failed, keeping in RAM: {e}");
            self.reinsert(&mut state, container, now_millis());
            return Err(e);
        }
        Ok(())
    }

    fn reinsert(&self, state: &mut CacheState, container: Container, last_seen: u64) {
        let hit_count = container.len();
        state.ram_postings += container.len();
        state.ram.insert(
            container.word(),
            CacheEntry {
                container,
                hit_count,
                last_seen,
            },
        );
    }

    /// Flush one victim entry according to the eviction policy. Returns
    /// true if an entry left the RAM cache.
    fn flush_one(&self, state: &mut CacheState) -> bool {
        if state.ram.is_empty() {
            return false;
        }
        let now = now_millis();
        let max_age = self.config.max_entry_age.as_millis() as u64;

        let Some((hot_word, hot_hits, hot_seen)) = state
            .ram
            .iter()
            .map(|(w, e)| (*w, e.hit_count, e.last_seen))
            .max_by_key(|&(_, hits, _)| hits)
        else {
            return false;
        };
        let hot_age = now.saturating_sub(hot_seen);

        let victim = if hot_hits > self.config.ram_cache_limit
            || (hot_hits > self.config.assortment_limit && hot_age > max_age)
        {
            hot_word
        } else {
            // least recently updated entry
            let Some(oldest) = state.ram.iter().min_by_key(|(_, e)| e.last_seen).map(|(w, _)| *w)
            else {
                return false;
            };
            oldest
        };
        self.flush_entry(state, victim)
    }

    fn flush_entry(&self, state: &mut CacheState, word: WordHash) -> bool {
        let Some(entry) = state.ram.remove(&word) else {
            return false;
        };
        let original = entry.container.len();
        state.ram_postings = state.ram_postings.saturating_sub(original);

        if original <= self.config.assortment_limit {
            match state.assortments.store(entry.container) {
                None => {
                    debug!("flushed {word} ({original} postings) into assortments");
                    true
                }
                Some(rest) => {
                    if rest.len() < original {
                        // partially absorbed; the remainder stays hot in RAM
                        // with a recomputed score
                        debug!("assortments absorbed {} of {original} postings of {word}", original - rest.len());
                        self.reinsert(state, rest, now_millis());
                        true
                    } else {
                        self.put_backend(state, rest, entry.hit_count, entry.last_seen)
                    }
                }
            }
        } else {
            self.put_backend(state, entry.container, entry.hit_count, entry.last_seen)
        }
    }

    fn put_backend(
        &self,
        state: &mut CacheState,
        container: Container,
        hit_count: usize,
        last_seen: u64,
    ) -> bool {
        let word = container.word();
        let size = container.len();
        match self.backend.put(container.clone()) {
            Ok(_) => {
                debug!("flushed {word} ({size} postings) into backend");
                true
            }
            Err(e) => {
                warn!("backend flush of {word} failed, retrying next cycle: {e}");
                state.ram_postings += size;
                state.ram.insert(
                    word,
                    CacheEntry {
                        container,
                        hit_count,
                        last_seen,
                    },
                );
                false
            }
        }
    }

    /// Restore one container into the assortment tier; overflow continues
    /// to the backend.
    fn absorb_restored(&self, container: Container) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(rest) = state.assortments.store(container) {
            drop(state);
            self.backend.put(rest)?;
        }
        Ok(())
    }

    /// Sleep interval of the flush task: shrinks as the cached tiers fill,
    /// whichever of RAM and assortments is fuller.
    fn flush_interval(&self) -> Duration {
        let state = self.state.lock();
        if state.ram.is_empty() {
            return self.config.max_flush_sleep;
        }
        let ram_fill = state.ram.len() as f64 / self.config.max_words as f64;
        let slots = (state.assortments.class_count() * self.config.assortment_slots).max(1);
        let assortment_fill =
            state.assortments.class_sizes().iter().sum::<usize>() as f64 / slots as f64;
        let fill = ram_fill.max(assortment_fill).min(1.0);
        let min = self.config.min_flush_sleep.as_millis() as f64;
        let max = self.config.max_flush_sleep.as_millis() as f64;
        Duration::from_millis((max - (max - min) * fill) as u64)
    }
}

fn flush_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        let interval = shared.flush_interval();
        let mut slept = Duration::ZERO;
        while slept < interval && shared.running.load(Ordering::Acquire) {
            let step = Duration::from_millis(100).min(interval - slept);
            thread::sleep(step);
            slept += step;
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        // respect pause requests from foreground operations
        {
            let mut pauses = shared.control.pauses.lock();
            while *pauses > 0 && shared.running.load(Ordering::Acquire) {
                shared
                    .control
                    .resumed
                    .wait_for(&mut pauses, Duration::from_millis(200));
            }
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let mut state = shared.state.lock();
        if state.ram.is_empty() {
            continue;
        }
        shared.flush_one(&mut state);
    }
}

/// Merge two ascending, duplicate-free sequences into one, dropping
/// duplicates across the two.
struct MergeAscending<A: Iterator<Item = WordHash>, B: Iterator<Item = WordHash>> {
    a: Peekable<A>,
    b: Peekable<B>,
}

impl<A: Iterator<Item = WordHash>, B: Iterator<Item = WordHash>> MergeAscending<A, B> {
    fn new(a: A, b: B) -> Self {
        MergeAscending {
            a: a.peekable(),
            b: b.peekable(),
        }
    }
}

impl<A: Iterator<Item = WordHash>, B: Iterator<Item = WordHash>> Iterator for MergeAscending<A, B> {
    type Item = WordHash;

    fn next(&mut self) -> Option<WordHash> {
        match (self.a.peek(), self.b.peek()) {
            (Some(x), Some(y)) => {
                use std::cmp::Ordering::*;
                match x.cmp(y) {
                    Less => self.a.next(),
                    Greater => self.b.next(),
                    Equal => {
                        self.b.next();
                        self.a.next()
                    }
                }
            }
            (Some(_), None) => self.a.next(),
            (None, Some(_)) => self.b.next(),
            (None, None) => None,
        }
    }
}
