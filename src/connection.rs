//! Peer transports.
//!
//! A [`Transport`] is one network connection to one remote address. Three
//! variants exist: [`TcpConnection`], [`UtpConnection`] (BEP-29) and
//! [`HttpConnection`] (BEP-19 web seeds, which emulate a seeding peer).
//! [`ConnectionFactory`] picks the variant for an address.
//!
//! Transports use `&self` for every operation so the receive loop and the
//! queue drainer can share one through an `Arc`. Disposing a transport
//! fails any connect, send or receive that is still waiting.
//!
//! # Examples
//!
//! ```
//! use peerwire::connection::{ConnectionFactory, PeerAddress, TransportKind};
//! use peerwire::settings::ProtocolPolicy;
//!
//! let addr = PeerAddress::parse("ipv4://127.0.0.1:6881").unwrap();
//! let conn = ConnectionFactory::create(&addr, ProtocolPolicy::TcpThenUtp).unwrap();
//! assert_eq!(conn.kind(), TransportKind::Tcp);
//!
//! let fallback = ConnectionFactory::fallback(&addr, TransportKind::Tcp, ProtocolPolicy::TcpThenUtp);
//! assert_eq!(fallback.map(|c| c.kind()), Some(TransportKind::Utp));
//! ```

mod address;
mod factory;
mod http;
mod tcp;
mod utp;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::peer::PeerError;
use crate::torrent::TorrentContext;

pub use address::{AddressError, PeerAddress};
pub use factory::ConnectionFactory;
pub use http::HttpConnection;
pub use tcp::TcpConnection;
pub use utp::UtpConnection;

/// Transport variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Utp,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Utp => "utp",
            TransportKind::Http => "http",
        })
    }
}

/// A connection to one remote peer.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn address(&self) -> &PeerAddress;

    /// Resolved socket address, if the address has one.
    fn endpoint(&self) -> Option<SocketAddr>;

    /// Raw IP octets of the remote.
    fn address_bytes(&self) -> Vec<u8> {
        match self.endpoint() {
            Some(SocketAddr::V4(addr)) => addr.ip().octets().to_vec(),
            Some(SocketAddr::V6(addr)) => addr.ip().octets().to_vec(),
            None => Vec::new(),
        }
    }

    fn is_connected(&self) -> bool;

    /// Whether a later attempt to the same address may succeed.
    fn can_reconnect(&self) -> bool;

    fn is_incoming(&self) -> bool;

    async fn connect(&self) -> Result<(), PeerError>;

    async fn send(&self, buf: &[u8]) -> Result<usize, PeerError>;

    /// Reads up to `buf.len()` bytes. Returns 0 once the remote has closed.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize, PeerError>;

    /// Closes the connection. Idempotent.
    fn dispose(&self);

    /// Tells the transport which torrent it serves.
    fn attach_torrent(&self, _context: &TorrentContext) {}
}

/// One-shot signal raised when a transport is disposed.
#[derive(Debug)]
pub(crate) struct DisposeSignal {
    tx: watch::Sender<bool>,
}

impl DisposeSignal {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }

    /// Raises the signal. Returns true the first time.
    pub(crate) fn raise(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the signal is raised.
    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|raised| *raised).await;
    }
}
