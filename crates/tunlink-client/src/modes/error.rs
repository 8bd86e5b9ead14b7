//! Errors raised by the built-in service units.

use crate::tunnel::TunnelError;

#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    #[error("{0} is not supported by this build")]
    Unsupported(&'static str),

    #[error("Failed to listen on {listen}: {source}")]
    Bind {
        listen: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener task failed: {0}")]
    Task(String),
}
