//! Distributed query execution: query model, ranking, and the search
//! engine orchestration.

pub mod event;
pub mod process;
pub mod query;
pub mod ranking;
pub mod sort_stack;

pub use event::{build_abstract, SearchConfig, SearchEngine, SearchStats};
pub use process::{RankingProcess, SearchResultEntry};
pub use query::{ContentDomain, Query, SearchScope};
pub use ranking::RankingProfile;
pub use sort_stack::SortStack;
