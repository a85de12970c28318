//! Engine and per-torrent configuration.
//!
//! # Examples
//!
//! ```
//! use peerwire::settings::{EngineSettings, ProtocolPolicy};
//! use std::time::Duration;
//!
//! let settings = EngineSettings::default()
//!     .with_protocol_policy(ProtocolPolicy::TcpThenUtp)
//!     .with_max_half_open_connections(4)
//!     .with_connection_timeout(Duration::from_secs(5));
//!
//! assert_eq!(settings.max_half_open_connections, 4);
//! ```

use std::time::Duration;

use crate::constants::{
    CONNECTION_TIMEOUT, DEFAULT_MAX_OPEN_FILES, DEFAULT_UPLOAD_SLOTS,
    MAX_CONNECTIONS_PER_TORRENT, MAX_HALF_OPEN_CONNECTIONS, MAX_OPEN_CONNECTIONS, STOP_TIMEOUT,
};
use crate::peer::EncryptionTypes;

/// Which transports outgoing `ipv4`/`ipv6` connections may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolPolicy {
    /// TCP only.
    #[default]
    Tcp,
    /// uTP only.
    Utp,
    /// TCP first, uTP after a failed handshake.
    TcpThenUtp,
    /// uTP first, TCP after a failed handshake.
    UtpThenTcp,
}

/// Settings shared by every torrent registered with the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Global ceiling on open connections.
    pub max_connections: usize,
    /// Global ceiling on outstanding outgoing connection attempts.
    pub max_half_open_connections: usize,
    /// Age after which a pending connect is cancelled.
    pub connection_timeout: Duration,
    /// Transport selection policy.
    pub protocol_policy: ProtocolPolicy,
    /// Ceiling on concurrently open file handles (0 = unbounded).
    pub max_open_files: usize,
    /// Encryption modes new peers start out with.
    pub allowed_encryption: EncryptionTypes,
    /// Longest a stopping torrent waits for its files to close.
    pub stop_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_connections: MAX_OPEN_CONNECTIONS,
            max_half_open_connections: MAX_HALF_OPEN_CONNECTIONS,
            connection_timeout: CONNECTION_TIMEOUT,
            protocol_policy: ProtocolPolicy::default(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            allowed_encryption: EncryptionTypes::ALL,
            stop_timeout: STOP_TIMEOUT,
        }
    }
}

impl EngineSettings {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_half_open_connections(mut self, max: usize) -> Self {
        self.max_half_open_connections = max;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_protocol_policy(mut self, policy: ProtocolPolicy) -> Self {
        self.protocol_policy = policy;
        self
    }

    pub fn with_max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    pub fn with_allowed_encryption(mut self, allowed: EncryptionTypes) -> Self {
        self.allowed_encryption = allowed;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// Settings for a single torrent.
#[derive(Debug, Clone)]
pub struct TorrentSettings {
    /// Ceiling on open connections for this torrent.
    pub max_connections: usize,
    /// Number of peers we upload to at once.
    pub upload_slots: usize,
}

impl Default for TorrentSettings {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS_PER_TORRENT,
            upload_slots: DEFAULT_UPLOAD_SLOTS,
        }
    }
}

impl TorrentSettings {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_upload_slots(mut self, slots: usize) -> Self {
        self.upload_slots = slots;
        self
    }
}
