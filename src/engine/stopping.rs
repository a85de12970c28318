use std::sync::Arc;

use tracing::{debug, warn};

use super::connection_manager::ConnectionManager;
use crate::torrent::{TorrentManager, TorrentMode, TrackerEvent};

impl ConnectionManager {
    /// Stops `torrent`: every connection is torn down, its files are
    /// closed and trackers are told, without waiting on the announce.
    ///
    /// Closing files is bounded by the engine's stop timeout; the torrent
    /// is stopped afterwards either way.
    pub async fn stop_torrent(self: &Arc<Self>, torrent: &Arc<TorrentManager>) {
        torrent.set_mode(TorrentMode::Stopping);

        let cancelled = self.cancel_all_pending_connects(torrent);
        let sessions = torrent.peers().connected.clone();
        debug!(cancelled, sessions = sessions.len(), "stopping torrent");
        for session in &sessions {
            self.cleanup_socket(torrent, session);
        }

        torrent.monitor().reset();
        torrent.picker().reset();
        torrent.peers().clear_all();

        let announcer = Arc::clone(torrent.announcer());
        tokio::spawn(async move {
            if let Err(e) = announcer.announce(TrackerEvent::Stopped).await {
                debug!(error = %e, "stopped announce failed");
            }
        });

        let close = self.disk().close_files(torrent.files());
        if tokio::time::timeout(self.settings().stop_timeout, close)
            .await
            .is_err()
        {
            warn!("timed out waiting for files to close");
        }

        torrent.set_mode(TorrentMode::Stopped);
    }
}
