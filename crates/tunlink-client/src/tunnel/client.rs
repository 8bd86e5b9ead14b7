//! Reconnecting tunnel shared by every service unit.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::error::TunnelError;
use super::handle::{
    HandshakeEvent, Transport, TunnelHandle, TunnelSession, TunnelStream,
};

/// Current session plus the number of handshakes completed so far.
#[derive(Default)]
struct SessionSlot {
    current: Option<Arc<dyn TunnelSession>>,
    handshakes: u64,
}

/// Tunnel handle that re-establishes its transport session on demand.
///
/// A session is created eagerly at construction unless the config is lazy.
/// When a dial finds no live session it reconnects following the
/// [`ReconnectPolicy`](super::ReconnectPolicy). Every successful handshake
/// is pushed into the event channel with a strictly increasing counter.
pub struct ReconnectableTunnel {
    config: TunnelConfig,
    transport: Arc<dyn Transport>,
    slot: Mutex<SessionSlot>,
    events: mpsc::UnboundedSender<HandshakeEvent>,
    closed_tx: watch::Sender<bool>,
}

impl ReconnectableTunnel {
    /// Build the tunnel. With `lazy = false` the first handshake happens
    /// here and its failure is returned; there is no retry at setup.
    pub async fn connect(
        config: TunnelConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<HandshakeEvent>,
    ) -> Result<Self, TunnelError> {
        let (closed_tx, _) = watch::channel(false);
        let tunnel = Self {
            config,
            transport,
            slot: Mutex::new(SessionSlot::default()),
            events,
            closed_tx,
        };

        if tunnel.config.lazy {
            info!(
                transport = tunnel.transport.name(),
                "Lazy mode enabled, deferring tunnel handshake"
            );
        } else {
            let mut slot = tunnel.slot.lock().await;
            tunnel.establish(&mut slot).await?;
        }
        Ok(tunnel)
    }

    /// Number of successful handshakes so far.
    pub async fn handshake_count(&self) -> u64 {
        self.slot.lock().await.handshakes
    }

    /// Perform one handshake, racing it against closure.
    async fn establish(
        &self,
        slot: &mut SessionSlot,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let mut closed = self.closed_tx.subscribe();
        let (session, info) = tokio::select! {
            result = self.transport.connect(&self.config.transport) => result?,
            _ = closed.wait_for(|closed| *closed) => return Err(TunnelError::Closed),
        };

        let session: Arc<dyn TunnelSession> = Arc::from(session);
        slot.handshakes = slot.handshakes.saturating_add(1);
        slot.current = Some(Arc::clone(&session));

        let event = HandshakeEvent {
            info,
            count: slot.handshakes,
        };
        if self.events.send(event).is_err() {
            debug!("No handshake subscriber attached");
        }
        Ok(session)
    }

    /// Return the live session, reconnecting with backoff if there is none.
    async fn session(&self) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let mut closed = self.closed_tx.subscribe();
        let mut slot = self.slot.lock().await;
        if *closed.borrow() {
            return Err(TunnelError::Closed);
        }
        if let Some(session) = &slot.current {
            return Ok(Arc::clone(session));
        }

        let policy = &self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            match self.establish(&mut slot).await {
                Ok(session) => return Ok(session),
                Err(TunnelError::Closed) => return Err(TunnelError::Closed),
                Err(e) => {
                    let delay = policy.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    if !policy.should_retry(attempt) {
                        warn!(error = %e, attempt, "Giving up on tunnel reconnect");
                        return Err(e);
                    }

                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");
                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = closed.wait_for(|closed| *closed) => {
                            info!("Tunnel closed during reconnect wait");
                            return Err(TunnelError::Closed);
                        }
                    }
                }
            }
        }
    }

    /// Forget `broken` if it is still the current session.
    async fn discard(&self, broken: &Arc<dyn TunnelSession>) {
        let mut slot = self.slot.lock().await;
        let is_current = slot
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, broken));
        if is_current {
            slot.current = None;
        }
        drop(slot);

        if is_current {
            if let Err(e) = broken.close().await {
                debug!(error = %e, "Error closing broken session");
            }
        }
    }
}

#[async_trait]
impl TunnelHandle for ReconnectableTunnel {
    async fn tcp(&self, addr: &str) -> Result<TunnelStream, TunnelError> {
        let session = self.session().await?;
        match session.tcp(addr).await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_session_fatal() => {
                warn!(error = %e, addr, "Tunnel session lost, will reconnect on next dial");
                self.discard(&session).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        let session = self.slot.lock().await.current.take();
        if let Some(session) = session {
            session.close().await?;
        }
        info!(transport = self.transport.name(), "Tunnel closed");
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}
