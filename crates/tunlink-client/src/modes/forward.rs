//! TCP forwarding through the tunnel.
//!
//! Every forwarding entry gets its own local listener. Each accepted
//! connection is dialed to the entry's remote through the shared tunnel and
//! piped in both directions until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info};

use tunlink_core::config::TcpForwardingEntry;

use super::error::ModeError;
use super::{ModeFactory, SharedTunnel};
use crate::supervisor::UnitFuture;
use crate::tunnel::TunnelHandle;

/// Mode factory with the modes this crate implements itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinModes;

impl ModeFactory for BuiltinModes {
    fn tcp_forwarding(&self, entries: Vec<TcpForwardingEntry>, tunnel: SharedTunnel) -> UnitFuture {
        Box::pin(async move {
            let forwarder = TcpForwarder::bind(&entries).await?;
            forwarder.serve(tunnel).await?;
            Ok(())
        })
    }
}

/// Bound TCP forwarding listeners.
pub struct TcpForwarder {
    listeners: Vec<(TcpListener, String)>,
}

impl TcpForwarder {
    /// Bind every listener up front so a bad address fails the unit before
    /// any traffic is accepted.
    pub async fn bind(entries: &[TcpForwardingEntry]) -> Result<Self, ModeError> {
        let mut listeners = Vec::with_capacity(entries.len());
        for entry in entries {
            let listener =
                TcpListener::bind(&entry.listen)
                    .await
                    .map_err(|source| ModeError::Bind {
                        listen: entry.listen.clone(),
                        source,
                    })?;
            info!(listen = %entry.listen, remote = %entry.remote, "TCP forwarding up and running");
            listeners.push((listener, entry.remote.clone()));
        }
        Ok(Self { listeners })
    }

    /// Actual bound addresses, in entry order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    /// Accept and forward until the tunnel is closed or a listener fails.
    pub async fn serve(self, tunnel: SharedTunnel) -> Result<(), ModeError> {
        let mut tasks = JoinSet::new();
        for (listener, remote) in self.listeners {
            tasks.spawn(accept_loop(listener, remote, Arc::clone(&tunnel)));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(ModeError::Task(e.to_string())),
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    remote: String,
    tunnel: SharedTunnel,
) -> Result<(), ModeError> {
    let mut closed = tunnel.closed();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, peer) = accepted.map_err(ModeError::Accept)?;
                let tunnel = Arc::clone(&tunnel);
                let remote = remote.clone();
                tokio::spawn(async move {
                    match forward_connection(conn, &remote, tunnel.as_ref()).await {
                        Ok((up, down)) => {
                            debug!(%peer, %remote, up, down, "TCP forwarding connection closed");
                        }
                        Err(e) => debug!(%peer, %remote, error = %e, "TCP forwarding error"),
                    }
                });
            }
            _ = closed.wait_for(|closed| *closed) => {
                info!(%remote, "Tunnel closed, stopping TCP forwarding listener");
                return Ok(());
            }
        }
    }
}

async fn forward_connection(
    mut conn: TcpStream,
    remote: &str,
    tunnel: &dyn TunnelHandle,
) -> Result<(u64, u64), ModeError> {
    let mut upstream = tunnel.tcp(remote).await?;
    let transferred = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    Ok(transferred)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::tunnel::{DirectTransport, ReconnectableTunnel, TunnelConfig};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn direct_tunnel() -> SharedTunnel {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut transport = tunlink_core::config::TransportConfig::default();
        transport.server = "direct".into();
        let tunnel = ReconnectableTunnel::connect(
            TunnelConfig::new(transport, false),
            Arc::new(DirectTransport),
            tx,
        )
        .await
        .unwrap();
        Arc::new(tunnel)
    }

    fn entry(listen: &str, remote: SocketAddr) -> TcpForwardingEntry {
        TcpForwardingEntry {
            listen: listen.into(),
            remote: remote.to_string(),
        }
    }

    #[tokio::test]
    async fn forwards_bytes_through_the_tunnel() {
        let remote = echo_server().await;
        let tunnel = direct_tunnel().await;
        let forwarder = TcpForwarder::bind(&[entry("127.0.0.1:0", remote)])
            .await
            .unwrap();
        let local = forwarder.local_addrs()[0];
        let serving = tokio::spawn(forwarder.serve(Arc::clone(&tunnel)));

        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"ping through tunnel").await.unwrap();
        let mut buf = [0u8; 19];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping through tunnel");

        tunnel.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("forwarder should stop once the tunnel closes")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = TcpForwarder::bind(&[entry(&addr.to_string(), addr)]).await;
        assert!(matches!(result, Err(ModeError::Bind { .. })));
    }

    #[tokio::test]
    async fn builtin_factory_runs_forwarding_unit() {
        let remote = echo_server().await;
        let tunnel = direct_tunnel().await;
        let unit = BuiltinModes.tcp_forwarding(vec![entry("127.0.0.1:0", remote)], Arc::clone(&tunnel));
        let running = tokio::spawn(unit);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnel.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("unit should exit after close")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn builtin_factory_leaves_other_modes_unsupported() {
        let tunnel = direct_tunnel().await;
        let unit = BuiltinModes.tun(
            tunlink_core::config::TunConfig {
                name: "tl0".into(),
                mtu: None,
                timeout: None,
                address: None,
            },
            tunnel,
        );
        let err = unit.await.unwrap_err();
        assert!(err.to_string().contains("TUN is not supported"));
    }
}
