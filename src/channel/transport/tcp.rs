//! TCP transport for secure channels.
//!
//! This provides a TCP-based transport using tokio for async I/O.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::channel::error::ChannelError;
use crate::channel::transport::{boxed, BoxedTransport};

/// TCP listener for accepting inbound connections.
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    /// Bind to an address and start listening.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ChannelError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to bind: {}", e)))?;
        Ok(Self { listener })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(BoxedTransport, SocketAddr), ChannelError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to accept: {}", e)))?;
        configure(&stream);
        debug!(%addr, "accepted tcp connection");
        Ok((boxed(stream), addr))
    }

    /// Get the local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.listener
            .local_addr()
            .map_err(|e| ChannelError::Transport(format!("Failed to get local addr: {}", e)))
    }
}

/// Default time allowed for establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound TCP connector.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound the time spent in `connect`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect to a remote address.
    pub async fn connect(&self, addr: &str) -> Result<BoxedTransport, ChannelError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ChannelError::Timeout("tcp connect"))?
            .map_err(|e| ChannelError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        configure(&stream);
        debug!(%addr, "connected tcp transport");
        Ok(boxed(stream))
    }
}

fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }
}
