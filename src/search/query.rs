//! Query model.

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;

use crate::index::{Bitfield, WordHash};

/// Where a query looks for results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Local index only.
    Local,
    /// Local index plus remote fan-out.
    Global,
}

/// Content domain a query targets. Non-text domains restrict results to
/// documents flagged as carrying that media type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentDomain {
    Text,
    Image,
    Audio,
    Video,
    App,
}

impl ContentDomain {
    /// The posting flag bit corresponding to a media domain, `None` for
    /// plain text.
    pub fn flag_bit(&self) -> Option<u32> {
        match self {
            ContentDomain::Text => None,
            ContentDomain::Image => Some(Bitfield::HAS_IMAGE),
            ContentDomain::Audio => Some(Bitfield::HAS_AUDIO),
            ContentDomain::Video => Some(Bitfield::HAS_VIDEO),
            ContentDomain::App => Some(Bitfield::HAS_APP),
        }
    }
}

/// A conjunctive query: every include word must match, no exclude word may.
#[derive(Clone, Debug)]
pub struct Query {
    /// Words that must all occur in a matching document.
    pub include: BTreeSet<WordHash>,

    /// Words that must not occur.
    pub exclude: BTreeSet<WordHash>,

    /// Flag constraint applied to candidate postings.
    pub constraint: Option<Bitfield>,

    /// Constraint mode: true requires every constraint bit, false requires
    /// at least one.
    pub all_of_constraint: bool,

    /// Content domain filter.
    pub content_domain: ContentDomain,

    /// Pattern awarded a ranking bonus when it matches URL or title.
    pub prefer: Option<Regex>,

    /// Maximum positional spread between include words in a document;
    /// `None` disables the proximity constraint.
    pub max_distance: Option<u32>,

    /// Number of results the caller wants.
    pub wanted_results: usize,

    /// Local or network-wide search.
    pub scope: SearchScope,

    /// Overall time budget of the query.
    pub time_budget: Duration,
}

impl Query {
    /// Minimal local query over a set of include words.
    pub fn over(words: &[&str]) -> Self {
        Query {
            include: words.iter().map(|w| WordHash::from_word(w)).collect(),
            exclude: BTreeSet::new(),
            constraint: None,
            all_of_constraint: true,
            content_domain: ContentDomain::Text,
            prefer: None,
            max_distance: None,
            wanted_results: 10,
            scope: SearchScope::Local,
            time_budget: Duration::from_secs(6),
        }
    }

    /// Add exclude words.
    pub fn without(mut self, words: &[&str]) -> Self {
        self.exclude.extend(words.iter().map(|w| WordHash::from_word(w)));
        self
    }

    /// Switch to network-wide scope.
    pub fn global(mut self) -> Self {
        self.scope = SearchScope::Global;
        self
    }
}
