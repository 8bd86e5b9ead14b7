//! Interfaces between the orchestrator, the tunnel transport, and the
//! service units riding on the tunnel.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use tunlink_core::config::TransportConfig;

use super::error::TunnelError;

/// Byte stream carried by the tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream returned by [`TunnelHandle::tcp`].
pub type TunnelStream = Box<dyn TunnelIo>;

/// Details of one successful (re)handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeInfo {
    /// Whether the server accepts UDP relaying on this session.
    pub udp_enabled: bool,
    /// Negotiated transmit bandwidth in bytes per second (0 = unknown).
    pub tx_bps: u64,
}

/// Pushed by the tunnel after every successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeEvent {
    pub info: HandshakeInfo,
    /// 1 for the first handshake, strictly increasing afterwards.
    pub count: u64,
}

/// The shared, self-healing tunnel every service unit runs against.
///
/// Closing is the only cancellation primitive: once [`close`](Self::close)
/// has been called, [`closed`](Self::closed) observers see `true` and every
/// dial fails with [`TunnelError::Closed`].
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    /// Open a TCP stream to `addr` through the tunnel.
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError>;

    /// Close the tunnel. Idempotent and safe to call concurrently.
    async fn close(&self) -> Result<(), TunnelError>;

    /// Watch that flips to `true` once the tunnel is closed.
    fn closed(&self) -> watch::Receiver<bool>;

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool {
        *self.closed().borrow()
    }
}

/// One established transport session.
#[async_trait]
pub trait TunnelSession: Send + Sync {
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError>;

    async fn close(&self) -> Result<(), TunnelError>;
}

/// Wire-level tunnel implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Establish a new session and report the handshake result.
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<(Box<dyn TunnelSession>, HandshakeInfo), TunnelError>;
}
