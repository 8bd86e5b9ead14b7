//! Tunlink Client Library
//!
//! Lifecycle layer of the tunnel client:
//! - Shared reconnecting tunnel with handshake events
//! - One supervised service unit per configured client mode
//! - Shutdown on signal, stop request or the first unit to end
//! - Post-connect update check

pub mod lifecycle;
pub mod modes;
pub mod shutdown;
pub mod supervisor;
pub mod tunnel;
pub mod update;

#[cfg(test)]
mod testing;

pub use lifecycle::{ClientError, HandshakeSubscriber, Phase, TunnelController};
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use supervisor::{ModeSupervisor, RunOutcome};
