use std::sync::Arc;

use tracing::trace;

use super::{HttpConnection, PeerAddress, TcpConnection, Transport, TransportKind, UtpConnection};
use crate::settings::ProtocolPolicy;

/// Builds transports for peer addresses. Performs no I/O.
pub struct ConnectionFactory;

impl ConnectionFactory {
    /// The primary transport for `address` under `policy`.
    ///
    /// Returns `None` for unknown schemes and for `ipv4` addresses without a
    /// port.
    pub fn create(address: &PeerAddress, policy: ProtocolPolicy) -> Option<Arc<dyn Transport>> {
        match address.scheme() {
            "ipv4" | "ipv6" => {
                let endpoint = match address.socket_addr() {
                    Some(endpoint) => endpoint,
                    None => {
                        trace!(%address, "no port, not connecting");
                        return None;
                    }
                };
                let kind = match policy {
                    ProtocolPolicy::Tcp | ProtocolPolicy::TcpThenUtp => TransportKind::Tcp,
                    ProtocolPolicy::Utp | ProtocolPolicy::UtpThenTcp => TransportKind::Utp,
                };
                Some(Self::socket(address, endpoint, kind))
            }
            "http" | "https" => Some(Arc::new(HttpConnection::new(address.clone()).ok()?)),
            _ => None,
        }
    }

    /// The other socket transport, if `policy` allows crossing over after an
    /// attempt that used `used`.
    pub fn fallback(
        address: &PeerAddress,
        used: TransportKind,
        policy: ProtocolPolicy,
    ) -> Option<Arc<dyn Transport>> {
        let kind = match (policy, used) {
            (ProtocolPolicy::TcpThenUtp, TransportKind::Tcp) => TransportKind::Utp,
            (ProtocolPolicy::UtpThenTcp, TransportKind::Utp) => TransportKind::Tcp,
            _ => return None,
        };
        if !matches!(address.scheme(), "ipv4" | "ipv6") {
            return None;
        }
        let endpoint = address.socket_addr()?;
        Some(Self::socket(address, endpoint, kind))
    }

    fn socket(
        address: &PeerAddress,
        endpoint: std::net::SocketAddr,
        kind: TransportKind,
    ) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Utp => Arc::new(UtpConnection::new(address.clone(), endpoint)),
            _ => Arc::new(TcpConnection::new(address.clone(), endpoint)),
        }
    }
}
