use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::PeerAddress;
use crate::peer::{Peer, PeerSession};

/// The disjoint peer sets of one torrent plus its live sessions.
///
/// A peer is in at most one of `available`, `connecting`, `active` and
/// `banned`. Membership is by address.
#[derive(Debug, Default)]
pub struct PeerSets {
    pub available: VecDeque<Arc<Peer>>,
    pub connecting: Vec<Arc<Peer>>,
    pub active: Vec<Arc<Peer>>,
    pub banned: Vec<Arc<Peer>>,
    pub connected: Vec<Arc<PeerSession>>,
}

fn position<'a>(
    mut peers: impl Iterator<Item = &'a Arc<Peer>>,
    address: &PeerAddress,
) -> Option<usize> {
    peers.position(|p| p.address() == address)
}

impl PeerSets {
    /// Adds a newly discovered peer. Returns false if it is already known.
    pub fn add_available(&mut self, peer: Arc<Peer>) -> bool {
        if self.is_known(peer.address()) {
            return false;
        }
        self.available.push_back(peer);
        true
    }

    pub fn is_known(&self, address: &PeerAddress) -> bool {
        self.is_available(address)
            || self.is_connecting(address)
            || self.is_active(address)
            || self.is_banned(address)
    }

    pub fn is_available(&self, address: &PeerAddress) -> bool {
        position(self.available.iter(), address).is_some()
    }

    pub fn is_connecting(&self, address: &PeerAddress) -> bool {
        position(self.connecting.iter(), address).is_some()
    }

    pub fn is_active(&self, address: &PeerAddress) -> bool {
        position(self.active.iter(), address).is_some()
    }

    pub fn is_banned(&self, address: &PeerAddress) -> bool {
        position(self.banned.iter(), address).is_some()
    }

    /// Removes and returns the first available peer matching `pred`.
    pub fn take_available(&mut self, mut pred: impl FnMut(&Peer) -> bool) -> Option<Arc<Peer>> {
        let index = self.available.iter().position(|p| pred(p))?;
        self.available.remove(index)
    }

    pub fn remove_available(&mut self, address: &PeerAddress) -> Option<Arc<Peer>> {
        let index = position(self.available.iter(), address)?;
        self.available.remove(index)
    }

    /// Puts `peer` at the front of the available queue unless it is
    /// already there.
    pub fn readmit(&mut self, peer: Arc<Peer>) -> bool {
        if self.is_available(peer.address()) {
            return false;
        }
        self.available.push_front(peer);
        true
    }

    pub fn remove_connecting(&mut self, address: &PeerAddress) -> bool {
        match position(self.connecting.iter(), address) {
            Some(index) => {
                self.connecting.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_active(&mut self, address: &PeerAddress) -> bool {
        match position(self.active.iter(), address) {
            Some(index) => {
                self.active.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_connected(&mut self, session_id: u64) -> bool {
        match self.connected.iter().position(|s| s.id() == session_id) {
            Some(index) => {
                self.connected.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn ban(&mut self, peer: Arc<Peer>) {
        if !self.is_banned(peer.address()) {
            self.banned.push(peer);
        }
    }

    pub fn clear_all(&mut self) {
        self.available.clear();
        self.connecting.clear();
        self.active.clear();
        self.banned.clear();
        self.connected.clear();
    }
}
