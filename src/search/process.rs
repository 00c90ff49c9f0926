//! Per-search ranking: bounded top-K maintenance, domain diversity and the
//! post-ranking score.
//!
//! One `RankingProcess` exists per search and is never shared between
//! searches. Postings stream in from the local index and from remote
//! peers; results stream out best-first through `best_result`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::trace;

use crate::index::{Container, DocHash, DomainId, Posting};
use crate::metadata::{DocumentRecord, DocumentStore};
use crate::search::query::Query;
use crate::search::ranking::RankingProfile;
use crate::search::sort_stack::SortStack;

/// One entry of the final result sequence.
#[derive(Clone, Debug)]
pub struct SearchResultEntry {
    pub doc: DocHash,
    pub rank: u64,
    pub posting: Posting,
    pub record: DocumentRecord,
}

/// Lowercased alphanumeric tokens of a string.
fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Streaming top-K merge over postings with diversity-aware extraction.
pub struct RankingProcess {
    query: Query,
    profile: RankingProfile,
    store: Arc<dyn DocumentStore>,

    stack: SortStack<Posting>,
    /// Deferred postings of domains that already produced a result.
    domain_stacks: BTreeMap<DomainId, SortStack<Posting>>,
    max_entries: usize,

    seen: BTreeSet<DocHash>,
    returned_domains: BTreeSet<DomainId>,
    misses: BTreeSet<DocHash>,
    top_words: BTreeMap<String, usize>,

    local_count: usize,
    remote_count: usize,
    filtered_count: usize,
    position: u64,
}

impl RankingProcess {
    pub fn new(query: Query, profile: RankingProfile, store: Arc<dyn DocumentStore>, max_entries: usize) -> Self {
        RankingProcess {
            query,
            profile,
            store,
            stack: SortStack::new(max_entries),
            domain_stacks: BTreeMap::new(),
            max_entries,
            seen: BTreeSet::new(),
            returned_domains: BTreeSet::new(),
            misses: BTreeSet::new(),
            top_words: BTreeMap::new(),
            local_count: 0,
            remote_count: 0,
            filtered_count: 0,
            position: 0,
        }
    }

    /// Feed a container of candidate postings. Filtered and duplicate
    /// postings are counted but not kept.
    pub fn insert(&mut self, container: &Container, is_local: bool) {
        for posting in container.postings() {
            if self.seen.contains(&posting.doc) {
                continue;
            }
            if !self.passes_filters(posting) {
                self.filtered_count += 1;
                continue;
            }
            self.seen.insert(posting.doc);
            if is_local {
                self.local_count += 1;
            } else {
                self.remote_count += 1;
            }
            let rank = pre_rank(posting);
            if !self.stack.push(rank, *posting) {
                trace!("posting for {} dropped below top-{}", posting.doc, self.max_entries);
            }
        }
    }

    fn passes_filters(&self, posting: &Posting) -> bool {
        if let Some(constraint) = self.query.constraint {
            let ok = if self.query.all_of_constraint {
                posting.flags.matches_all(constraint)
            } else {
                posting.flags.matches_any(constraint)
            };
            if !ok {
                return false;
            }
        }
        if let Some(bit) = self.query.content_domain.flag_bit() {
            if !posting.flags.get(bit) {
                return false;
            }
        }
        true
    }

    /// Extract the next best result. With `skip_domain_duplicates`, a
    /// candidate whose site already produced a result is deferred into its
    /// per-domain holding stack; those holdings are drawn from, best across
    /// domains first, once the primary stack is exhausted.
    pub fn best_result(&mut self, skip_domain_duplicates: bool) -> Option<SearchResultEntry> {
        while let Some((_, posting)) = self.stack.pop_best() {
            let domain = posting.doc.domain();
            if skip_domain_duplicates && self.returned_domains.contains(&domain) {
                self.domain_stacks
                    .entry(domain)
                    .or_insert_with(|| SortStack::new(self.max_entries))
                    .push(pre_rank(&posting), posting);
                continue;
            }
            if let Some(entry) = self.resolve(posting) {
                self.returned_domains.insert(domain);
                return Some(entry);
            }
        }

        // primary stack exhausted: draw from the per-domain holdings,
        // best-ranked domain first
        loop {
            let domain = self
                .domain_stacks
                .iter()
                .filter(|(_, s)| !s.is_empty())
                .max_by_key(|(_, s)| s.best_rank().unwrap_or(0))
                .map(|(d, _)| *d)?;
            let posting = self.domain_stacks.get_mut(&domain)?.pop_best()?.1;
            if let Some(entry) = self.resolve(posting) {
                return Some(entry);
            }
        }
    }

    /// Resolve a posting against the document store and compute its final
    /// score. An unresolvable document goes into the miss set.
    fn resolve(&mut self, posting: Posting) -> Option<SearchResultEntry> {
        let record = match self.store.load(&posting.doc, Some(&posting)) {
            Ok(Some(record)) => record,
            Ok(None) | Err(_) => {
                self.misses.insert(posting.doc);
                return None;
            }
        };
        let position = self.position;
        self.position += 1;
        let rank = self.post_rank(&record, position);
        Some(SearchResultEntry {
            doc: posting.doc,
            rank,
            posting,
            record,
        })
    }

    /// Post-ranking score: a position base term plus bit-shift weighted
    /// bonuses. Earlier extraction positions score higher; every bonus term
    /// carries the same 256 scale as one position step and is shifted by
    /// its profile coefficient, so coefficients dominate exponentially
    /// rather than linearly. Media bonuses scale with the media count.
    fn post_rank(&self, record: &DocumentRecord, position: u64) -> u64 {
        let mut rank: u64 = (255u64.saturating_sub(position)) << 8;

        match self.query.content_domain.flag_bit() {
            Some(crate::index::Bitfield::HAS_IMAGE) if record.image_count > 0 => {
                rank += media_bonus(record.image_count, self.profile.cat_has_image);
            }
            Some(crate::index::Bitfield::HAS_AUDIO) if record.audio_count > 0 => {
                rank += media_bonus(record.audio_count, self.profile.cat_has_audio);
            }
            Some(crate::index::Bitfield::HAS_VIDEO) if record.video_count > 0 => {
                rank += media_bonus(record.video_count, self.profile.cat_has_video);
            }
            Some(crate::index::Bitfield::HAS_APP) if record.app_count > 0 => {
                rank += media_bonus(record.app_count, self.profile.cat_has_app);
            }
            _ => {}
        }

        if let Some(prefer) = &self.query.prefer {
            if prefer.is_match(&record.url) || prefer.is_match(&record.title) {
                rank += 256 << self.profile.prefer;
            }
        }

        let url_tokens = tokens(&record.url);
        let title_tokens = tokens(&record.title);
        for token in &url_tokens {
            if self.top_words.contains_key(token) {
                rank += 256 << self.profile.url_comp_in_top_list;
            }
            if self.query.include.contains(&crate::index::WordHash::from_word(token)) {
                rank += 256 << self.profile.app_url;
            }
        }
        for token in &title_tokens {
            if self.top_words.contains_key(token) {
                rank += 256 << self.profile.descr_comp_in_top_list;
            }
            if self.query.include.contains(&crate::index::WordHash::from_word(token)) {
                rank += 256 << self.profile.app_title;
            }
        }

        rank
    }

    /// Accumulate reference words (typically title tokens of prior result
    /// sets) used by the common-sense bonus.
    pub fn add_topics(&mut self, words: &[String]) {
        for word in words {
            for token in tokens(word) {
                *self.top_words.entry(token).or_insert(0) += 1;
            }
        }
    }

    /// Entries currently held in the primary structure.
    pub fn size(&self) -> usize {
        self.stack.len()
    }

    /// Documents whose records could not be loaded.
    pub fn miss_count(&self) -> usize {
        self.misses.len()
    }

    /// The miss set itself, for cleanup jobs.
    pub fn misses(&self) -> &BTreeSet<DocHash> {
        &self.misses
    }

    pub fn local_count(&self) -> usize {
        self.local_count
    }

    pub fn remote_count(&self) -> usize {
        self.remote_count
    }

    pub fn filtered_count(&self) -> usize {
        self.filtered_count
    }
}

/// Media bonus of the post-ranking score: the media-link count, capped at
/// the 256 scale of the position base, shifted by the profile coefficient.
fn media_bonus(count: u32, coeff: u32) -> u64 {
    (count.min(256) as u64) << coeff
}

/// Pre-ranking key used for top-K maintenance before document records are
/// available: quality first, then document recency, then earlier word
/// position.
fn pre_rank(posting: &Posting) -> u64 {
    let quality = posting.quality as u64;
    let recency = (posting.last_modified >> 16) & 0xffff_ffff;
    let position = u16::MAX as u64 - (posting.pos_in_text as u64).min(u16::MAX as u64);
    (quality << 48) | (recency << 16) | position
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Bitfield, WordHash};
    use crate::metadata::MemoryDocumentStore;
    use crate::search::query::ContentDomain;

    fn doc_on(host: &str, page: &str) -> DocHash {
        DocHash::from_url(&format!("http://{host}/{page}"), host)
    }

    fn store_with(docs: &[DocHash]) -> Arc<MemoryDocumentStore> {
        let store = MemoryDocumentStore::new();
        for (n, d) in docs.iter().enumerate() {
            store.put(DocumentRecord::new(*d, &format!("http://host/{n}"), &format!("page {n}")));
        }
        Arc::new(store)
    }

    fn process(store: Arc<MemoryDocumentStore>, max: usize) -> RankingProcess {
        RankingProcess::new(Query::over(&["cat"]), RankingProfile::default(), store, max)
    }

    fn container_of(postings: &[Posting]) -> Container {
        let mut c = Container::new(WordHash::from_word("cat"));
        for p in postings {
            c.add(*p);
        }
        c
    }

    #[test]
    fn test_bounded_and_non_increasing() {
        let docs: Vec<DocHash> = (0..8).map(|n| doc_on(&format!("h{n}.net"), "p")).collect();
        let store = store_with(&docs);
        let mut proc = process(store, 3);

        let postings: Vec<Posting> = docs
            .iter()
            .enumerate()
            .map(|(n, d)| {
                let mut p = Posting::new(*d, 1, 1000 + n as u64);
                p.quality = n as u8;
                p
            })
            .collect();
        proc.insert(&container_of(&postings), true);
        assert!(proc.size() <= 3);

        let mut last = u64::MAX;
        while let Some(entry) = proc.best_result(false) {
            assert!(entry.rank <= last);
            last = entry.rank;
        }
    }

    #[test]
    fn test_domain_diversity() {
        let a1 = doc_on("site-a.net", "1");
        let a2 = doc_on("site-a.net", "2");
        let a3 = doc_on("site-a.net", "3");
        let b1 = doc_on("site-b.net", "1");
        let store = store_with(&[a1, a2, a3, b1]);
        let mut proc = process(store, 10);

        // site-a postings rank higher than site-b's
        let mut postings = Vec::new();
        for (n, d) in [a1, a2, a3].iter().enumerate() {
            let mut p = Posting::new(*d, 1, 1000);
            p.quality = 200 - n as u8;
            postings.push(p);
        }
        postings.push(Posting::new(b1, 1, 1000));
        proc.insert(&container_of(&postings), true);

        let first = proc.best_result(true).unwrap();
        let second = proc.best_result(true).unwrap();
        assert_ne!(first.doc.domain(), second.doc.domain());
        // the deferred site-a postings surface afterwards
        let third = proc.best_result(true).unwrap();
        assert_eq!(third.doc.domain(), a1.domain());
    }

    #[test]
    fn test_constraint_filtering() {
        let d1 = doc_on("site-a.net", "1");
        let d2 = doc_on("site-b.net", "1");
        let store = store_with(&[d1, d2]);

        let mut query = Query::over(&["cat"]);
        query.constraint = Some(Bitfield::with(&[Bitfield::HAS_IMAGE]));
        let mut proc = RankingProcess::new(query, RankingProfile::default(), store, 10);

        let mut with_flag = Posting::new(d1, 1, 1000);
        with_flag.flags.set(Bitfield::HAS_IMAGE);
        let without_flag = Posting::new(d2, 1, 1000);
        proc.insert(&container_of(&[with_flag, without_flag]), true);

        assert_eq!(proc.filtered_count(), 1);
        let only = proc.best_result(false).unwrap();
        assert_eq!(only.doc, d1);
        assert!(proc.best_result(false).is_none());
    }

    #[test]
    fn test_content_domain_filter() {
        let d1 = doc_on("site-a.net", "1");
        let store = store_with(&[d1]);

        let mut query = Query::over(&["cat"]);
        query.content_domain = ContentDomain::Video;
        let mut proc = RankingProcess::new(query, RankingProfile::default(), store, 10);

        proc.insert(&container_of(&[Posting::new(d1, 1, 1000)]), true);
        assert_eq!(proc.filtered_count(), 1);
        assert!(proc.best_result(false).is_none());
    }

    #[test]
    fn test_unresolvable_document_is_a_miss() {
        let d1 = doc_on("site-a.net", "1");
        let store = Arc::new(MemoryDocumentStore::new()); // empty: no records
        let mut proc = process(store, 10);

        proc.insert(&container_of(&[Posting::new(d1, 1, 1000)]), true);
        assert!(proc.best_result(false).is_none());
        assert_eq!(proc.miss_count(), 1);
        assert!(proc.misses().contains(&d1));
    }

    #[test]
    fn test_media_bonus_scales_with_link_count() {
        let rich = doc_on("site-a.net", "gallery");
        let poor = doc_on("site-b.net", "page");
        let store = MemoryDocumentStore::new();
        let mut r = DocumentRecord::new(rich, "http://site-a.net/gallery", "gallery");
        r.image_count = 9;
        store.put(r);
        let mut p = DocumentRecord::new(poor, "http://site-b.net/page", "page");
        p.image_count = 1;
        store.put(p);

        let mut query = Query::over(&["cat"]);
        query.content_domain = ContentDomain::Image;
        let profile = RankingProfile::for_domain(ContentDomain::Image);
        let mut proc = RankingProcess::new(query, profile, Arc::new(store), 10);

        let mut poor_posting = Posting::new(poor, 1, 1000);
        poor_posting.flags.set(Bitfield::HAS_IMAGE);
        poor_posting.quality = 10;
        let mut rich_posting = Posting::new(rich, 1, 1000);
        rich_posting.flags.set(Bitfield::HAS_IMAGE);
        // the image-poor document extracts first, yet the image count
        // outweighs its position advantage
        proc.insert(&container_of(&[poor_posting, rich_posting]), true);

        let mut results = Vec::new();
        while let Some(e) = proc.best_result(false) {
            results.push(e);
        }
        let rich_rank = results.iter().find(|e| e.doc == rich).unwrap().rank;
        let poor_rank = results.iter().find(|e| e.doc == poor).unwrap().rank;
        assert!(rich_rank > poor_rank);
    }

    #[test]
    fn test_query_term_in_title_scores_higher() {
        let d1 = doc_on("site-a.net", "1");
        let d2 = doc_on("site-b.net", "1");
        let store = MemoryDocumentStore::new();
        store.put(DocumentRecord::new(d1, "http://site-a.net/1", "all about cat care"));
        store.put(DocumentRecord::new(d2, "http://site-b.net/1", "unrelated"));
        let mut proc = process(Arc::new(store), 10);

        proc.insert(
            &container_of(&[Posting::new(d1, 1, 1000), Posting::new(d2, 1, 1000)]),
            true,
        );
        let mut results = Vec::new();
        while let Some(e) = proc.best_result(false) {
            results.push(e);
        }
        let titled = results.iter().find(|e| e.doc == d1).unwrap();
        let plain = results.iter().find(|e| e.doc == d2).unwrap();
        assert!(titled.rank > plain.rank);
    }
}
