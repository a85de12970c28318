use std::fmt;

use crate::peer::Peer;

/// What a torrent is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentMode {
    #[default]
    Stopped,
    Downloading,
    Seeding,
    Stopping,
    /// A disk failure stopped all transfer.
    Error,
}

impl TorrentMode {
    pub fn can_accept_connections(self) -> bool {
        matches!(self, TorrentMode::Downloading | TorrentMode::Seeding)
    }

    pub fn can_handle_messages(self) -> bool {
        matches!(self, TorrentMode::Downloading | TorrentMode::Seeding)
    }

    /// Whether an outgoing connection to `peer` is worth making.
    pub fn should_connect(self, peer: &Peer) -> bool {
        match self {
            TorrentMode::Seeding => !peer.is_seeder(),
            _ => true,
        }
    }
}

impl fmt::Display for TorrentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TorrentMode::Stopped => "stopped",
            TorrentMode::Downloading => "downloading",
            TorrentMode::Seeding => "seeding",
            TorrentMode::Stopping => "stopping",
            TorrentMode::Error => "error",
        };
        f.write_str(name)
    }
}
