//! Traffic accounting.
//!
//! Every byte crossing a connection is first charged as protocol traffic.
//! Once a frame is known to carry piece data, the payload portion is moved
//! from the protocol counters to the data counters with a pair of signed
//! deltas, so frame overhead stays classified as protocol traffic.

use std::sync::atomic::{AtomicI64, Ordering};

/// A single signed byte counter.
#[derive(Debug, Default)]
pub struct SpeedMonitor {
    total: AtomicI64,
}

impl SpeedMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` bytes, which may be negative when reclassifying traffic.
    pub fn add_delta(&self, delta: i64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
    }
}

/// Protocol and data counters in both directions for one peer or torrent.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    pub protocol_up: SpeedMonitor,
    pub protocol_down: SpeedMonitor,
    pub data_up: SpeedMonitor,
    pub data_down: SpeedMonitor,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `bytes` received from protocol to data accounting.
    pub fn reclassify_down(&self, bytes: i64) {
        self.protocol_down.add_delta(-bytes);
        self.data_down.add_delta(bytes);
    }

    /// Moves `bytes` sent from protocol to data accounting.
    pub fn reclassify_up(&self, bytes: i64) {
        self.protocol_up.add_delta(-bytes);
        self.data_up.add_delta(bytes);
    }

    pub fn reset(&self) {
        self.protocol_up.reset();
        self.protocol_down.reset();
        self.data_up.reset();
        self.data_down.reset();
    }
}
