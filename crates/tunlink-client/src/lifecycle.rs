//! Connection lifecycle of the tunnel client.
//!
//! [`TunnelController`] owns everything one run needs: it builds the shared
//! tunnel, registers the configured modes, waits for the first terminal
//! event and tears the run down. The host keeps one controller and calls
//! [`TunnelController::start`] / [`TunnelController::stop`] on it.

use std::sync::{Arc, Weak};

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use tunlink_core::ClientConfig;

use crate::modes::{ModeFactory, SharedTunnel, register_modes};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownSignal};
use crate::tunnel::{
    HandshakeEvent, ReconnectPolicy, ReconnectableTunnel, Transport, TunnelConfig, TunnelError,
    TunnelHandle,
};
use crate::update::PostConnectAction;

/// Errors returned by [`TunnelController::start`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    Config(#[from] tunlink_core::Error),

    #[error("failed to initialize tunnel: {0}")]
    Setup(#[source] TunnelError),

    #[error("tunnel client is already running")]
    AlreadyRunning,
}

/// Lifecycle phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    NotStarted,
    Running,
    Stopped,
}

/// Factory for the shutdown signal of each run.
pub type SignalSource = Arc<dyn Fn() -> ShutdownSignal + Send + Sync>;

/// Reacts to tunnel handshakes.
///
/// Every handshake is logged. The post-connect action runs once, on the
/// first handshake of a run, and never on reconnects.
pub struct HandshakeSubscriber {
    post_connect: Option<Arc<dyn PostConnectAction>>,
    post_connect_disabled: bool,
    // Weak: the tunnel owns the event sender, so a strong handle here would
    // keep the event stream open forever.
    tunnel: Weak<dyn TunnelHandle>,
}

impl HandshakeSubscriber {
    pub fn new(
        post_connect: Option<Arc<dyn PostConnectAction>>,
        disabled: bool,
        tunnel: &SharedTunnel,
    ) -> Self {
        Self {
            post_connect,
            post_connect_disabled: disabled,
            tunnel: Arc::downgrade(tunnel),
        }
    }

    /// Handle one event. Returns whether the post-connect action was spawned.
    pub fn on_handshake(&self, event: &HandshakeEvent) -> bool {
        if event.count == 1 {
            info!(
                udp_enabled = event.info.udp_enabled,
                tx_bps = event.info.tx_bps,
                "Connected to server"
            );
        } else {
            info!(
                count = event.count,
                udp_enabled = event.info.udp_enabled,
                tx_bps = event.info.tx_bps,
                "Reconnected to server"
            );
        }

        if event.count != 1 || self.post_connect_disabled {
            return false;
        }
        let Some(action) = &self.post_connect else {
            return false;
        };
        let Some(tunnel) = self.tunnel.upgrade() else {
            debug!("Tunnel already gone, skipping post-connect action");
            return false;
        };
        let action = Arc::clone(action);
        tokio::spawn(async move { action.run(tunnel).await });
        true
    }

    /// Consume events until every sender is gone.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<HandshakeEvent>) {
        while let Some(event) = events.recv().await {
            self.on_handshake(&event);
        }
        debug!("Handshake event stream ended");
    }
}

/// Phase, tunnel handle and stop notifier of the current run. Always
/// written together.
#[derive(Default)]
struct ControllerState {
    phase: Phase,
    handle: Option<SharedTunnel>,
    stop_tx: Option<watch::Sender<bool>>,
}

/// Tears a committed run down if its future is dropped before the run
/// finished on its own.
struct RunGuard {
    state: Arc<RwLock<ControllerState>>,
    handle: SharedTunnel,
    finished: bool,
}

impl RunGuard {
    async fn finish(mut self) {
        release(&self.state, &self.handle).await;
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Run dropped outside of a runtime, tunnel left open");
            return;
        };
        let state = Arc::clone(&self.state);
        let handle = Arc::clone(&self.handle);
        runtime.spawn(async move {
            warn!("Run dropped before shutdown, closing tunnel");
            if let Err(e) = handle.close().await {
                warn!(error = %e, "Error closing tunnel");
            }
            release(&state, &handle).await;
        });
    }
}

/// Clear the run's state, unless a newer run has taken over.
async fn release(state: &RwLock<ControllerState>, handle: &SharedTunnel) {
    let mut state = state.write().await;
    let is_current = state
        .handle
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(current, handle));
    if is_current {
        state.phase = Phase::Stopped;
        state.handle = None;
        state.stop_tx = None;
    }
}

/// Starts, supervises and stops tunnel client runs.
pub struct TunnelController {
    transport: Arc<dyn Transport>,
    modes: Arc<dyn ModeFactory>,
    post_connect: Option<Arc<dyn PostConnectAction>>,
    /// `None` uses the process's termination signals.
    signal: Option<SignalSource>,
    reconnect: ReconnectPolicy,
    state: Arc<RwLock<ControllerState>>,
}

impl TunnelController {
    pub fn new(transport: Arc<dyn Transport>, modes: Arc<dyn ModeFactory>) -> Self {
        Self {
            transport,
            modes,
            post_connect: None,
            signal: None,
            reconnect: ReconnectPolicy::default(),
            state: Arc::new(RwLock::new(ControllerState::default())),
        }
    }

    /// Action to run after the first handshake of each run.
    #[must_use]
    pub fn with_post_connect(mut self, action: Arc<dyn PostConnectAction>) -> Self {
        self.post_connect = Some(action);
        self
    }

    /// Replace the OS termination signals. With a custom source no OS
    /// signal handler is ever installed.
    #[must_use]
    pub fn with_signal_source(mut self, signal: SignalSource) -> Self {
        self.signal = Some(signal);
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Parse `config_json` and run until shutdown.
    pub async fn start(&self, config_json: &str) -> Result<ShutdownReason, ClientError> {
        let config = ClientConfig::from_json(config_json).map_err(|e| {
            error!(error = %e, "Invalid client configuration");
            ClientError::Config(e)
        })?;
        self.run(config).await
    }

    /// Run an already parsed config until shutdown.
    ///
    /// Resolves with the reason the run ended. Service failures are a
    /// [`ShutdownReason::ServiceFailed`], not an error. Dropping the future
    /// after the run started closes the tunnel and returns the controller
    /// to [`Phase::Stopped`] in the background.
    pub async fn run(&self, config: ClientConfig) -> Result<ShutdownReason, ClientError> {
        if self.is_running().await {
            error!("Tunnel client is already running");
            return Err(ClientError::AlreadyRunning);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tunnel_config =
            TunnelConfig::from_client_config(&config).with_reconnect(self.reconnect.clone());
        let tunnel = ReconnectableTunnel::connect(tunnel_config, Arc::clone(&self.transport), events_tx)
            .await
            .map_err(|e| {
                error!(error = %e, transport = self.transport.name(), "Failed to initialize tunnel");
                ClientError::Setup(e)
            })?;
        let handle: SharedTunnel = Arc::new(tunnel);

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut state = self.state.write().await;
            if state.phase == Phase::Running {
                drop(state);
                if let Err(e) = handle.close().await {
                    debug!(error = %e, "Error closing unused tunnel");
                }
                error!("Tunnel client is already running");
                return Err(ClientError::AlreadyRunning);
            }
            state.phase = Phase::Running;
            state.handle = Some(Arc::clone(&handle));
            state.stop_tx = Some(stop_tx);
        }
        let guard = RunGuard {
            state: Arc::clone(&self.state),
            handle: Arc::clone(&handle),
            finished: false,
        };
        info!(transport = self.transport.name(), lazy = config.lazy, "Tunnel client started");

        let subscriber = HandshakeSubscriber::new(
            self.post_connect.clone(),
            config.disable_update_check,
            &handle,
        );
        tokio::spawn(subscriber.run(events_rx));

        if config.has_no_modes() {
            warn!("No modes configured");
        }
        let supervisor = register_modes(&config, &handle, self.modes.as_ref());
        let mut coordinator = ShutdownCoordinator::new(stop_rx);
        if let Some(signal) = &self.signal {
            coordinator = coordinator.with_signal(signal());
        }
        let reason = coordinator.run(supervisor, handle.as_ref()).await;

        guard.finish().await;
        info!(reason = %reason, "Tunnel client stopped");
        Ok(reason)
    }

    /// Close the running tunnel and wake the run loop.
    ///
    /// Returns `false` without side effects when nothing is running. Does
    /// not wait for [`run`](Self::run) to return.
    pub async fn stop(&self) -> bool {
        let (handle, stop_tx) = {
            let mut state = self.state.write().await;
            let Some(handle) = state.handle.take() else {
                debug!("Stop requested but tunnel client is not running");
                return false;
            };
            state.phase = Phase::Stopped;
            (handle, state.stop_tx.take())
        };

        if let Some(stop_tx) = stop_tx {
            stop_tx.send_replace(true);
        }
        if let Err(e) = handle.close().await {
            warn!(error = %e, "Error closing tunnel");
        }
        info!("Tunnel shutdown successful");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.phase == Phase::Running
    }

    pub async fn phase(&self) -> Phase {
        self.state.read().await.phase
    }
}
