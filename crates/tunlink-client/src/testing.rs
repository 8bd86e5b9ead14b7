//! In-crate test doubles for the transport and tunnel handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use tunlink_core::config::TransportConfig;

use crate::tunnel::{
    HandshakeInfo, Transport, TunnelError, TunnelHandle, TunnelSession, TunnelStream,
};

/// Transport that hands out in-memory sessions and can be scripted to fail.
pub struct MockTransport {
    pub connects: AtomicU32,
    failures_left: AtomicU32,
    pub session_closes: Arc<AtomicU32>,
    pub break_sessions: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::failing(0)
    }

    /// The first `failures` connect attempts fail with a connection error.
    pub fn failing(failures: u32) -> Self {
        Self {
            connects: AtomicU32::new(0),
            failures_left: AtomicU32::new(failures),
            session_closes: Arc::new(AtomicU32::new(0)),
            break_sessions: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(
        &self,
        _config: &TransportConfig,
    ) -> Result<(Box<dyn TunnelSession>, HandshakeInfo), TunnelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TunnelError::Connection("handshake refused".into()));
        }
        let session = MockSession {
            closes: Arc::clone(&self.session_closes),
            broken: Arc::clone(&self.break_sessions),
        };
        Ok((
            Box::new(session),
            HandshakeInfo {
                udp_enabled: true,
                tx_bps: 1_000_000,
            },
        ))
    }
}

struct MockSession {
    closes: Arc<AtomicU32>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl TunnelSession for MockSession {
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TunnelError::Connection("session reset".into()));
        }
        if addr.starts_with("refused") {
            return Err(TunnelError::Dial {
                addr: addr.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tunnel handle that only records closes.
pub struct MockTunnel {
    closed_tx: watch::Sender<bool>,
    pub effective_closes: AtomicU32,
    pub close_calls: AtomicU32,
}

impl MockTunnel {
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            closed_tx,
            effective_closes: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TunnelHandle for MockTunnel {
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        Err(TunnelError::Dial {
            addr: addr.to_string(),
            reason: "mock tunnel does not dial".into(),
        })
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed_tx.send_replace(true) {
            self.effective_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}
