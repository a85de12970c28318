//! The peer connection engine.
//!
//! [`ConnectionManager`] runs the connect scheduler for every registered
//! torrent, takes over accepted connections, drives each session's receive
//! loop and outbound queue, and cleans sessions up when they fail.
//!
//! # Outgoing connections
//!
//! [`ConnectionManager::try_connect`] walks torrents round-robin and starts
//! one connect per pass while both the open and half-open ceilings allow.
//! Each attempt runs as its own task:
//!
//! 1. connect the transport chosen by the protocol policy;
//! 2. negotiate encryption and send our handshake;
//! 3. read the remote handshake and check the info hash;
//! 4. check the session's bitfield length against the torrent;
//! 5. mark the session established and start its receive loop.
//!
//! A failure in step 2 or 3 narrows the encryption modes allowed for the
//! peer. If cleanup puts the peer back in the available queue, the attempt
//! is retried once: after a negotiation failure on a fresh primary
//! transport, after a handshake failure on the fallback transport.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::engine::{ConnectionEvent, ConnectionManager};
//! use peerwire::peer::{PeerId, PlainTextNegotiator};
//! use peerwire::settings::EngineSettings;
//! use peerwire::storage::{DiskManager, DiskWriter};
//! use peerwire::torrent::{TorrentContext, TorrentManager, TorrentMode};
//!
//! # async fn example() {
//! let disk = DiskManager::new(Arc::new(DiskWriter::new(20)));
//! let engine = ConnectionManager::new(
//!     PeerId::generate(),
//!     EngineSettings::default(),
//!     Arc::new(PlainTextNegotiator),
//!     disk,
//! );
//!
//! let torrent = Arc::new(
//!     TorrentManager::new([0u8; 20], TorrentContext::new(16384, 1 << 20), Vec::new())
//!         .with_mode(TorrentMode::Downloading),
//! );
//! engine.add(Arc::clone(&torrent));
//!
//! let mut events = engine.subscribe();
//! engine.try_connect();
//! while let Ok(event) = events.recv().await {
//!     if let ConnectionEvent::AttemptFailed { peer, reason, .. } = event {
//!         println!("{} failed: {}", peer.address(), reason);
//!     }
//! }
//! # }
//! ```

mod connection_manager;
mod events;
mod stopping;

#[cfg(test)]
mod tests;

pub use connection_manager::ConnectionManager;
pub use events::{BanFilter, ConnectionEvent};
