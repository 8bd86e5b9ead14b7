//! Shutdown coordination for one client run.
//!
//! The coordinator races three events: an OS termination signal, an
//! external stop request, and the supervisor's aggregated outcome. Whichever
//! arrives first decides the [`ShutdownReason`]; the tunnel is then closed
//! once. Service units are not awaited after the close.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

use crate::supervisor::{ModeSupervisor, RunOutcome};
use crate::tunnel::TunnelHandle;

/// Future that completes when the process should shut down.
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Waits for SIGINT/SIGTERM (or Ctrl-C on non-unix platforms).
///
/// Listeners are registered on the first poll and dropped with the future.
/// Dropping them stops delivery to this future only: tokio keeps its process
/// handler installed, so the default SIGINT/SIGTERM action (terminating the
/// process) is not restored. Embedding hosts that want their own handling
/// should pass a custom signal source instead.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// [`ShutdownSignal`] backed by the process's termination signals. See
/// [`wait_for_shutdown_signal`] for what stays installed after a run.
pub fn os_shutdown_signal() -> ShutdownSignal {
    Box::pin(async {
        if let Err(e) = wait_for_shutdown_signal().await {
            warn!(error = %e, "Failed to install signal handlers, waiting for stop request only");
            std::future::pending::<()>().await;
        }
    })
}

/// Why a run ended.
#[derive(Debug)]
pub enum ShutdownReason {
    /// An interrupt or termination signal arrived first.
    Signal,
    /// The host asked the controller to stop.
    StopRequested,
    /// A unit returned cleanly (or there were no units).
    Finished(RunOutcome),
    /// A unit failed; the whole group was torn down.
    ServiceFailed(RunOutcome),
}

impl ShutdownReason {
    /// Whether the run ended without a service failure.
    pub const fn is_graceful(&self) -> bool {
        !matches!(self, Self::ServiceFailed(_))
    }

    /// The supervisor outcome, when the supervisor decided the shutdown.
    pub const fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            Self::Finished(outcome) | Self::ServiceFailed(outcome) => Some(outcome),
            Self::Signal | Self::StopRequested => None,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => f.write_str("received shutdown signal"),
            Self::StopRequested => f.write_str("stop requested"),
            Self::Finished(outcome) | Self::ServiceFailed(outcome) => outcome.fmt(f),
        }
    }
}

/// Resolves once a stop is requested. A dropped sender never resolves.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drives the single teardown path of a run.
pub struct ShutdownCoordinator {
    /// `None` means the OS signals, built only when the run starts.
    signal: Option<ShutdownSignal>,
    stop: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    /// Coordinator that listens for OS signals and `stop` requests.
    pub const fn new(stop: watch::Receiver<bool>) -> Self {
        Self { signal: None, stop }
    }

    /// Replace the OS signal source.
    #[must_use]
    pub fn with_signal<F>(mut self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.signal = Some(Box::pin(signal));
        self
    }

    /// Whether the run will subscribe to the process's termination signals.
    pub const fn uses_os_signals(&self) -> bool {
        self.signal.is_none()
    }

    /// Launch the supervisor and block until the first terminal event, then
    /// close the tunnel.
    pub async fn run(self, supervisor: ModeSupervisor, tunnel: &dyn TunnelHandle) -> ShutdownReason {
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            // The coordinator may have returned already; nothing to report to.
            let _ = result_tx.send(supervisor.run().await);
        });

        let Self { signal, mut stop } = self;
        let signal = signal.unwrap_or_else(os_shutdown_signal);
        let reason = tokio::select! {
            () = signal => {
                info!("Received signal, shutting down gracefully");
                ShutdownReason::Signal
            }
            () = stop_requested(&mut stop) => {
                info!("Stop requested, shutting down");
                ShutdownReason::StopRequested
            }
            outcome = result_rx => {
                let outcome = outcome.unwrap_or_else(|_| RunOutcome::lost());
                if outcome.ok {
                    info!(unit = ?outcome.unit, "{}", outcome.message);
                    ShutdownReason::Finished(outcome)
                } else {
                    ShutdownReason::ServiceFailed(outcome)
                }
            }
        };

        if let ShutdownReason::ServiceFailed(outcome) = &reason {
            if let Err(e) = tunnel.close().await {
                warn!(error = %e, "Error closing tunnel after service failure");
            }
            error!(
                unit = ?outcome.unit,
                error = ?outcome.error,
                "{}",
                outcome.message
            );
        }

        if let Err(e) = tunnel.close().await {
            warn!(error = %e, "Error closing tunnel");
        }
        reason
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::testing::MockTunnel;

    fn never() -> impl Future<Output = ()> + Send + 'static {
        std::future::pending()
    }

    #[test]
    fn custom_signal_replaces_os_handlers() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert!(ShutdownCoordinator::new(stop_rx.clone()).uses_os_signals());
        assert!(!ShutdownCoordinator::new(stop_rx).with_signal(never()).uses_os_signals());
    }

    #[tokio::test]
    async fn signal_before_units_finish_closes_once() {
        let tunnel = MockTunnel::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut supervisor = ModeSupervisor::new();
        supervisor.add("SOCKS5 server", std::future::pending());

        let reason = ShutdownCoordinator::new(stop_rx)
            .with_signal(async {})
            .run(supervisor, &tunnel)
            .await;

        assert!(matches!(reason, ShutdownReason::Signal));
        assert!(reason.is_graceful());
        assert_eq!(tunnel.effective_closes.load(Ordering::SeqCst), 1);
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn service_failure_forces_close() {
        let tunnel = MockTunnel::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut supervisor = ModeSupervisor::new();
        supervisor.add("HTTP proxy server", async { Err(anyhow::anyhow!("bind failed")) });

        let reason = ShutdownCoordinator::new(stop_rx)
            .with_signal(never())
            .run(supervisor, &tunnel)
            .await;

        let ShutdownReason::ServiceFailed(outcome) = &reason else {
            unreachable!("expected a service failure, got {reason:?}");
        };
        assert_eq!(outcome.unit.as_deref(), Some("HTTP proxy server"));
        assert!(!reason.is_graceful());
        // Explicit close plus the deferred close, one effective close.
        assert_eq!(tunnel.close_calls.load(Ordering::SeqCst), 2);
        assert_eq!(tunnel.effective_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_finish_is_informational() {
        let tunnel = MockTunnel::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut supervisor = ModeSupervisor::new();
        supervisor.add("TUN", async { Ok(()) });

        let reason = ShutdownCoordinator::new(stop_rx)
            .with_signal(never())
            .run(supervisor, &tunnel)
            .await;

        assert!(matches!(reason, ShutdownReason::Finished(_)));
        assert_eq!(reason.to_string(), "TUN finished without error");
        assert_eq!(tunnel.effective_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_supervisor_finishes_immediately() {
        let tunnel = MockTunnel::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            ShutdownCoordinator::new(stop_rx)
                .with_signal(never())
                .run(ModeSupervisor::new(), &tunnel),
        )
        .await
        .expect("no units must not hang");

        assert!(matches!(reason, ShutdownReason::Finished(_)));
        assert_eq!(tunnel.effective_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_request_ends_the_run() {
        let tunnel = MockTunnel::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut supervisor = ModeSupervisor::new();
        supervisor.add("SOCKS5 server", std::future::pending());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stop_tx.send_replace(true);
            // Keep the sender alive until the coordinator has seen it.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let reason = ShutdownCoordinator::new(stop_rx)
            .with_signal(never())
            .run(supervisor, &tunnel)
            .await;

        assert!(matches!(reason, ShutdownReason::StopRequested));
        assert_eq!(tunnel.effective_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_stop_sender_is_not_a_stop_request() {
        let tunnel = MockTunnel::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);
        let mut supervisor = ModeSupervisor::new();
        supervisor.add("TCP redirect", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });

        let reason = ShutdownCoordinator::new(stop_rx)
            .with_signal(never())
            .run(supervisor, &tunnel)
            .await;

        assert!(matches!(reason, ShutdownReason::Finished(_)));
    }
}
