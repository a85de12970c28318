use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use super::encryption::EncryptionTypes;
use super::peer_id::PeerId;
use crate::connection::PeerAddress;

/// A remote peer known to a torrent.
///
/// Outlives any single connection: counters and the allowed encryption set
/// carry over between attempts so repeated failures eventually ban it.
pub struct Peer {
    address: PeerAddress,
    allowed_encryption: AtomicU8,
    failed_attempts: AtomicU32,
    cleaned_up: AtomicU32,
    is_seeder: AtomicBool,
    peer_id: Mutex<Option<PeerId>>,
}

impl Peer {
    pub fn new(address: PeerAddress, allowed_encryption: EncryptionTypes) -> Self {
        Self {
            address,
            allowed_encryption: AtomicU8::new(allowed_encryption.bits()),
            failed_attempts: AtomicU32::new(0),
            cleaned_up: AtomicU32::new(0),
            is_seeder: AtomicBool::new(false),
            peer_id: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn allowed_encryption(&self) -> EncryptionTypes {
        EncryptionTypes::from_bits(self.allowed_encryption.load(Ordering::Acquire))
    }

    pub fn set_allowed_encryption(&self, allowed: EncryptionTypes) {
        self.allowed_encryption
            .store(allowed.bits(), Ordering::Release);
    }

    /// Removes `modes` from the allowed set.
    pub fn forbid_encryption(&self, modes: EncryptionTypes) {
        self.allowed_encryption
            .fetch_and(!modes.bits(), Ordering::AcqRel);
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn record_failed_attempt(&self) -> u32 {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn cleaned_up(&self) -> u32 {
        self.cleaned_up.load(Ordering::Relaxed)
    }

    pub fn record_cleanup(&self) -> u32 {
        self.cleaned_up.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_seeder(&self) -> bool {
        self.is_seeder.load(Ordering::Relaxed)
    }

    pub fn set_seeder(&self, seeder: bool) {
        self.is_seeder.store(seeder, Ordering::Relaxed);
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock()
    }

    pub fn set_peer_id(&self, id: PeerId) {
        *self.peer_id.lock() = Some(id);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("allowed_encryption", &self.allowed_encryption())
            .field("failed_attempts", &self.failed_attempts())
            .field("cleaned_up", &self.cleaned_up())
            .finish()
    }
}
