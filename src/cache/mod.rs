//! Tiered word-index cache: RAM tier, assortment mid tier, dump
//! persistence and the background flush task.

pub mod assortment;
pub mod dump;
pub mod tiered;

pub use assortment::AssortmentCluster;
pub use dump::{DumpReader, DumpRow, DumpWriter};
pub use tiered::{TieredIndexConfig, TieredWordIndex};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch milliseconds. All cache timestamps use
/// this unit.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
