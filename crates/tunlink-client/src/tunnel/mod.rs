//! Shared tunnel for all client modes.
//!
//! Provides the [`TunnelHandle`] interface service units run against, the
//! [`ReconnectableTunnel`] wrapper that re-establishes transport sessions
//! and reports every handshake, and a passthrough [`DirectTransport`].

pub mod client;
pub mod config;
pub mod direct;
pub mod error;
pub mod handle;

pub use client::ReconnectableTunnel;
pub use config::{ReconnectPolicy, TunnelConfig};
pub use direct::DirectTransport;
pub use error::TunnelError;
pub use handle::{
    HandshakeEvent, HandshakeInfo, Transport, TunnelHandle, TunnelIo, TunnelSession,
    TunnelStream,
};
