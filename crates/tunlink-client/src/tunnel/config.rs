//! Tunnel configuration.

use std::time::Duration;

use tunlink_core::ClientConfig;
use tunlink_core::config::TransportConfig;

/// Configuration for the client's shared tunnel.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Transport section forwarded to the [`Transport`](super::Transport).
    pub transport: TransportConfig,

    /// Defer the first handshake until a service unit dials.
    pub lazy: bool,

    /// Reconnection policy used when a dial finds no live session.
    pub reconnect: ReconnectPolicy,
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before the second connect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of connect attempts per dial (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: Some(3),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

impl TunnelConfig {
    /// Create a tunnel config with the default reconnect policy.
    pub fn new(transport: TransportConfig, lazy: bool) -> Self {
        Self {
            transport,
            lazy,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Derive the tunnel config from a parsed client config.
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self::new(config.transport.clone(), config.lazy)
    }

    /// Replace the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_attempts, Some(3));
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = ReconnectPolicy::default();

        // 0.5s, 1s, 2s, 4s, 8s, 10s (capped), 10s
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn retry_with_max_attempts() {
        let policy = ReconnectPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn retry_unlimited() {
        let policy = ReconnectPolicy {
            max_attempts: None,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn tunnel_config_from_client_config() {
        let mut client = ClientConfig::default();
        client.transport.server = "relay.example.com:443".into();
        client.lazy = true;

        let config = TunnelConfig::from_client_config(&client);
        assert_eq!(config.transport.server, "relay.example.com:443");
        assert!(config.lazy);
        assert_eq!(config.reconnect.max_attempts, Some(3));
    }
}
