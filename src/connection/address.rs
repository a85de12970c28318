use std::fmt;
use std::net::{IpAddr, SocketAddr};

use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid peer uri: {0}")]
    Invalid(String),
}

/// The connection URI of a peer.
///
/// Swarm peers use the `ipv4://host:port` and `ipv6://[host]:port` schemes;
/// web seeds keep their `http(s)://` URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    uri: Url,
}

impl PeerAddress {
    pub fn parse(uri: &str) -> Result<Self, AddressError> {
        let uri = Url::parse(uri).map_err(|e| AddressError::Invalid(format!("{}: {}", uri, e)))?;
        Ok(Self { uri })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self, AddressError> {
        match addr {
            SocketAddr::V4(v4) => Self::parse(&format!("ipv4://{}", v4)),
            SocketAddr::V6(v6) => Self::parse(&format!("ipv6://{}", v6)),
        }
    }

    pub fn from_url(uri: Url) -> Self {
        Self { uri }
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    pub fn url(&self) -> &Url {
        &self.uri
    }

    pub fn port(&self) -> Option<u16> {
        self.uri.port()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        let host = self.uri.host_str()?;
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    /// The socket address of an `ipv4`/`ipv6` peer with an explicit port.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.port()?))
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.uri)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.uri, f)
    }
}
