//! # Nerita
//!
//! A peer-to-peer distributed inverted-index engine for Rust.
//!
//! Each peer maintains a partial inverted index (word -> documents) built
//! from crawled pages, serves local queries, and cooperates with other peers
//! through a DHT-style index exchange so that queries can be answered with
//! postings that live on remote peers.
//!
//! ## Features
//!
//! - Tiered word-index cache (RAM, bounded assortment tier, persistent
//!   backend) with background eviction
//! - DHT-based chunked index distribution with quorum-conditional deletion
//! - Time-budgeted distributed query execution with abstract-driven
//!   secondary search
//! - Bounded top-K result ranking with domain diversity

pub mod cache;
pub mod dht;
pub mod error;
pub mod index;
pub mod metadata;
pub mod search;
pub mod store;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
