use std::sync::Arc;

use async_trait::async_trait;

use super::error::TrackerError;
use crate::peer::{Message, Outgoing, PeerError, PeerSession};

/// Tracker announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

/// Tracks the blocks requested from each peer.
pub trait PiecePicker: Send + Sync {
    /// Returns every block requested from `session` to the pool.
    fn cancel_requests(&self, session: &PeerSession);

    /// Forgets all outstanding requests.
    fn reset(&self);
}

/// Torrent-level reaction to peer traffic.
pub trait MessageHandler: Send + Sync {
    /// Called once a session is established.
    fn handle_peer_connected(&self, session: &Arc<PeerSession>) -> Vec<Outgoing>;

    /// Handles one decoded message. The returned items are queued for the
    /// peer; an error disconnects it.
    fn handle_message(
        &self,
        session: &Arc<PeerSession>,
        message: Message,
    ) -> Result<Vec<Outgoing>, PeerError>;
}

#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, event: TrackerEvent) -> Result<(), TrackerError>;
}

/// A picker with no requests to track.
#[derive(Debug, Default)]
pub struct NoopPicker;

impl PiecePicker for NoopPicker {
    fn cancel_requests(&self, _session: &PeerSession) {}
    fn reset(&self) {}
}

/// Accepts every message and never replies.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn handle_peer_connected(&self, _session: &Arc<PeerSession>) -> Vec<Outgoing> {
        Vec::new()
    }

    fn handle_message(
        &self,
        _session: &Arc<PeerSession>,
        _message: Message,
    ) -> Result<Vec<Outgoing>, PeerError> {
        Ok(Vec::new())
    }
}

/// A torrent without trackers.
#[derive(Debug, Default)]
pub struct NoopAnnouncer;

#[async_trait]
impl Announcer for NoopAnnouncer {
    async fn announce(&self, _event: TrackerEvent) -> Result<(), TrackerError> {
        Ok(())
    }
}
