//! Passthrough transport that dials targets directly, without a remote
//! tunnel server. Useful for local testing of the front-ends.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use tunlink_core::config::TransportConfig;

use super::error::TunnelError;
use super::handle::{HandshakeInfo, Transport, TunnelSession, TunnelStream};

/// Transport whose sessions open plain TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTransport;

struct DirectSession;

#[async_trait]
impl Transport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<(Box<dyn TunnelSession>, HandshakeInfo), TunnelError> {
        debug!(server = %config.server, "Direct transport ignores the server address");
        Ok((Box::new(DirectSession), HandshakeInfo::default()))
    }
}

#[async_trait]
impl TunnelSession for DirectSession {
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Dial {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        Ok(())
    }
}
