//! Tunnel error types.

/// Errors that can occur on the shared tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The transport could not establish (or lost) the tunnel session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session broke while carrying a stream.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The remote target could not be reached through a healthy session.
    #[error("Failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// The tunnel has been closed and will not reconnect.
    #[error("Tunnel is closed")]
    Closed,
}

impl TunnelError {
    /// Whether this error means the current session is unusable and the next
    /// dial has to reconnect.
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Stream(_))
    }
}
