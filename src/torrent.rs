//! Per-torrent state seen by the connection engine.
//!
//! A [`TorrentManager`] owns the torrent's peer sets, its mode and the
//! collaborators the engine calls into: a [`PiecePicker`], a
//! [`MessageHandler`] and an [`Announcer`]. Each has a no-op default so a
//! torrent can be driven with only the parts a caller needs.
//!
//! # Examples
//!
//! ```
//! use peerwire::torrent::{TorrentContext, TorrentManager, TorrentMode};
//!
//! let context = TorrentContext::new(16384, 40000);
//! assert_eq!(context.piece_count(), 3);
//! assert_eq!(context.piece_size(2), Some(40000 - 2 * 16384));
//!
//! let torrent = TorrentManager::new([0u8; 20], context, Vec::new())
//!     .with_mode(TorrentMode::Downloading);
//! assert!(torrent.mode().can_accept_connections());
//! ```

mod collaborators;
mod context;
mod error;
mod manager;
mod mode;
mod peers;


pub use collaborators::{
    Announcer, MessageHandler, NoopAnnouncer, NoopHandler, NoopPicker, PiecePicker, TrackerEvent,
};
pub use context::TorrentContext;
pub use error::{ErrorReason, TorrentError, TrackerError};
pub use manager::TorrentManager;
pub use mode::TorrentMode;
pub use peers::PeerSets;
