//! DHT index distribution: peer identity and transport contract, chunk
//! selection, and the distributor with its quorum-conditional deletion.

pub mod chunk;
pub mod distributor;
pub mod transport;

pub use chunk::{ChunkSelector, DhtChunk};
pub use distributor::{DistributionConfig, IndexDistributor};
pub use transport::{dht_distance, IndexAbstract, Peer, PeerId, PeerTransport, RemoteSearchResult};
