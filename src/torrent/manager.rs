use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::collaborators::{
    Announcer, MessageHandler, NoopAnnouncer, NoopHandler, NoopPicker, PiecePicker,
};
use super::context::TorrentContext;
use super::error::{ErrorReason, TorrentError};
use super::mode::TorrentMode;
use super::peers::PeerSets;
use crate::bandwidth::RateLimiterPair;
use crate::connection::PeerAddress;
use crate::monitor::ConnectionMonitor;
use crate::settings::TorrentSettings;
use crate::storage::TorrentFile;

/// Connection-facing state of one torrent.
pub struct TorrentManager {
    info_hash: [u8; 20],
    context: TorrentContext,
    files: Vec<TorrentFile>,
    settings: TorrentSettings,
    mode: Mutex<TorrentMode>,
    peers: Mutex<PeerSets>,
    inactive: Mutex<HashSet<PeerAddress>>,
    uploading_to: AtomicUsize,
    monitor: ConnectionMonitor,
    limiters: RateLimiterPair,
    error: Mutex<Option<TorrentError>>,
    picker: Arc<dyn PiecePicker>,
    handler: Arc<dyn MessageHandler>,
    announcer: Arc<dyn Announcer>,
}

impl TorrentManager {
    pub fn new(info_hash: [u8; 20], context: TorrentContext, files: Vec<TorrentFile>) -> Self {
        Self {
            info_hash,
            context,
            files,
            settings: TorrentSettings::default(),
            mode: Mutex::new(TorrentMode::Stopped),
            peers: Mutex::new(PeerSets::default()),
            inactive: Mutex::new(HashSet::new()),
            uploading_to: AtomicUsize::new(0),
            monitor: ConnectionMonitor::new(),
            limiters: RateLimiterPair::unlimited(),
            error: Mutex::new(None),
            picker: Arc::new(NoopPicker),
            handler: Arc::new(NoopHandler),
            announcer: Arc::new(NoopAnnouncer),
        }
    }

    pub fn with_settings(mut self, settings: TorrentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_mode(self, mode: TorrentMode) -> Self {
        *self.mode.lock() = mode;
        self
    }

    pub fn with_limiters(mut self, limiters: RateLimiterPair) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn with_picker(mut self, picker: Arc<dyn PiecePicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = announcer;
        self
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn context(&self) -> &TorrentContext {
        &self.context
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn settings(&self) -> &TorrentSettings {
        &self.settings
    }

    pub fn mode(&self) -> TorrentMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: TorrentMode) {
        let mut current = self.mode.lock();
        if *current != mode {
            debug!(from = %*current, to = %mode, "torrent mode change");
            *current = mode;
        }
    }

    /// Locks the peer sets. Never hold the guard across an await.
    pub fn peers(&self) -> MutexGuard<'_, PeerSets> {
        self.peers.lock()
    }

    pub fn open_connections(&self) -> usize {
        self.peers.lock().connected.len()
    }

    /// Marks `address` as not worth reconnecting to.
    pub fn mark_inactive(&self, address: PeerAddress) {
        self.inactive.lock().insert(address);
    }

    pub fn is_inactive(&self, address: &PeerAddress) -> bool {
        self.inactive.lock().contains(address)
    }

    pub fn uploading_to(&self) -> usize {
        self.uploading_to.load(Ordering::Acquire)
    }

    /// Records that we unchoked a peer.
    pub fn start_uploading(&self) {
        self.uploading_to.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stop_uploading(&self) {
        let _ = self
            .uploading_to
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn limiters(&self) -> &RateLimiterPair {
        &self.limiters
    }

    pub fn picker(&self) -> &Arc<dyn PiecePicker> {
        &self.picker
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn announcer(&self) -> &Arc<dyn Announcer> {
        &self.announcer
    }

    pub fn error(&self) -> Option<TorrentError> {
        self.error.lock().clone()
    }

    /// Puts the torrent into the error state unless it is already there.
    /// Returns whether this call set the error.
    pub fn try_set_error(&self, reason: ErrorReason, message: impl Into<String>) -> bool {
        let mut error = self.error.lock();
        if error.is_some() {
            return false;
        }
        let message = message.into();
        warn!(%reason, %message, "torrent entering error state");
        *error = Some(TorrentError { reason, message });
        drop(error);
        self.set_mode(TorrentMode::Error);
        true
    }
}

impl fmt::Debug for TorrentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentManager")
            .field("info_hash", &self.info_hash)
            .field("mode", &self.mode())
            .field("context", &self.context)
            .finish()
    }
}
