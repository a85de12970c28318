//! peerwire - BitTorrent peer connections and disk handle caching
//!
//! This library drives the lifecycle of peer connections for a set of
//! torrents and keeps a bounded cache of open file handles for piece I/O.
//!
//! # Modules
//!
//! - [`engine`] - Outgoing connect pipeline, incoming acceptance, teardown
//! - [`connection`] - TCP, uTP and HTTP web seed transports
//! - [`peer`] - BEP-3/6 wire messages, framing, encryption negotiation
//! - [`torrent`] - Per-torrent state the engine drives
//! - [`storage`] - File handle cache and disk reads/writes
//! - [`cache`] - Pooled I/O buffers
//! - [`bandwidth`] - Token-bucket rate limiting
//! - [`monitor`] - Transfer counters
//! - [`settings`] - Engine and torrent limits

pub mod bandwidth;
pub mod cache;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod monitor;
pub mod peer;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod torrent;

pub use bandwidth::{RateLimiter, RateLimiterPair};
pub use cache::{BufferPool, PooledBuffer};
pub use connection::{ConnectionFactory, PeerAddress, Transport, TransportKind};
pub use engine::{ConnectionEvent, ConnectionManager};
pub use monitor::ConnectionMonitor;
pub use peer::{
    ConnectionFailureReason, EncryptionNegotiator, EncryptionTypes, Message, Peer, PeerError,
    PeerId, PeerSession,
};
pub use settings::{EngineSettings, ProtocolPolicy, TorrentSettings};
pub use storage::{DiskManager, DiskWriter, FileStreamCache, StorageError, TorrentFile};
pub use torrent::{TorrentContext, TorrentError, TorrentManager, TorrentMode};
