use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use super::{DisposeSignal, PeerAddress, Transport, TransportKind};
use crate::peer::PeerError;

/// A TCP stream transport.
#[derive(Debug)]
pub struct TcpConnection {
    address: PeerAddress,
    endpoint: SocketAddr,
    incoming: bool,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    disposed: DisposeSignal,
}

impl TcpConnection {
    /// An outgoing connection; call [`Transport::connect`] to open it.
    pub fn new(address: PeerAddress, endpoint: SocketAddr) -> Self {
        Self {
            address,
            endpoint,
            incoming: false,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            disposed: DisposeSignal::new(),
        }
    }

    /// Wraps a stream accepted by a listener.
    pub fn from_stream(stream: TcpStream, address: PeerAddress) -> Result<Self, PeerError> {
        let endpoint = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            address,
            endpoint,
            incoming: true,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            disposed: DisposeSignal::new(),
        })
    }
}

#[async_trait]
impl Transport for TcpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        Some(self.endpoint)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn can_reconnect(&self) -> bool {
        !self.incoming
    }

    fn is_incoming(&self) -> bool {
        self.incoming
    }

    async fn connect(&self) -> Result<(), PeerError> {
        if self.disposed.is_raised() {
            return Err(PeerError::Disposed);
        }

        trace!(endpoint = %self.endpoint, "tcp connect");
        let stream = tokio::select! {
            result = TcpStream::connect(self.endpoint) => result?,
            _ = self.disposed.wait() => return Err(PeerError::Disposed),
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, PeerError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let written = tokio::select! {
            result = writer.write(buf) => Some(result),
            _ = self.disposed.wait() => None,
        };
        match written {
            Some(result) => Ok(result?),
            None => {
                guard.take();
                Err(PeerError::Disposed)
            }
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, PeerError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let read = tokio::select! {
            result = reader.read(buf) => Some(result),
            _ = self.disposed.wait() => None,
        };
        match read {
            Some(result) => Ok(result?),
            None => {
                guard.take();
                Err(PeerError::Disposed)
            }
        }
    }

    fn dispose(&self) {
        if !self.disposed.raise() {
            return;
        }
        self.connected.store(false, Ordering::Release);
        // Halves held by an in-flight call are dropped by that call.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}
