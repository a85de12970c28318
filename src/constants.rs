//! Protocol constants and tuning parameters.
//!
//! Defaults for connection admission, wire framing, uTP and the file-handle
//! cache. Most of them can be overridden through [`crate::settings`].

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-PW0001-";

// ============================================================================
// Connection limits
// ============================================================================

/// Global ceiling on open (established) connections.
pub const MAX_OPEN_CONNECTIONS: usize = 150;

/// Global ceiling on concurrent outgoing connection attempts.
pub const MAX_HALF_OPEN_CONNECTIONS: usize = 8;

/// Per-torrent ceiling on open connections.
pub const MAX_CONNECTIONS_PER_TORRENT: usize = 60;

/// Upload slots per torrent.
pub const DEFAULT_UPLOAD_SLOTS: usize = 8;

/// Pending connects older than this are cancelled by the sweep.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A peer cleaned up this many times is banned instead of re-admitted.
pub const MAX_CLEANUPS_BEFORE_BAN: u32 = 5;

/// Automatic retries (encryption narrowing or transport fallback) allowed per
/// outgoing connection chain.
pub const MAX_AUTOMATIC_RETRIES: u32 = 1;

/// Buffered connection events per subscriber.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Wire framing
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: usize = 16384;

/// Largest message body accepted from a peer.
pub const MAX_MESSAGE_LENGTH: usize = BLOCK_SIZE * 4;

/// Network reads and writes are split into chunks of this size so the rate
/// limiter can interleave peers.
pub const CHUNK_LENGTH: usize = 2096 + 64;

// ============================================================================
// Buffer pool
// ============================================================================

/// Buffers at or below this size come from the small pool.
pub const SMALL_BUFFER_SIZE: usize = 4096;

/// Number of small buffers retained by the pool.
pub const SMALL_BUFFER_COUNT: usize = 512;

/// Number of large (block-sized and up) buffers retained by the pool.
pub const LARGE_BUFFER_COUNT: usize = 256;

// ============================================================================
// Storage
// ============================================================================

/// Default ceiling on concurrently open file handles.
pub const DEFAULT_MAX_OPEN_FILES: usize = 20;

/// Attempts made when renaming a file into place.
pub const MOVE_RETRY_ATTEMPTS: u32 = 3;

/// Pause between rename attempts.
pub const MOVE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// Shutdown
// ============================================================================

/// Upper bound on waiting for mandatory teardown when a torrent stops.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// uTP (BEP-29)
// ============================================================================

pub const UTP_VERSION: u8 = 1;
pub const UTP_HEADER_LEN: usize = 20;
pub const UTP_PAYLOAD_MAX: usize = 1200;
pub const UTP_WINDOW_SIZE: u32 = 1024 * 1024;

/// Time to wait for an ACK before retransmitting.
pub const UTP_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Retransmissions before a uTP connection is declared dead.
pub const UTP_MAX_RETRANSMITS: u32 = 6;

// ============================================================================
// HTTP seeds (BEP-19)
// ============================================================================

pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(60);
