//! Client modes and their registration with the supervisor.
//!
//! Each configured section of the client config becomes one service unit.
//! The unit bodies come from a [`ModeFactory`]; anything the factory does
//! not implement fails with [`ModeError::Unsupported`] when started.

pub mod error;
pub mod forward;

use std::sync::Arc;

use tunlink_core::ClientConfig;
use tunlink_core::config::{
    HttpConfig, Socks5Config, TcpForwardingEntry, TcpRedirectConfig, TcpTProxyConfig, TunConfig,
    UdpForwardingEntry, UdpTProxyConfig,
};

use crate::supervisor::{ModeSupervisor, UnitFuture};
use crate::tunnel::TunnelHandle;

pub use error::ModeError;
pub use forward::{BuiltinModes, TcpForwarder};

/// Tunnel handle shared by every unit of one run.
pub type SharedTunnel = Arc<dyn TunnelHandle>;

pub const SOCKS5_SERVER: &str = "SOCKS5 server";
pub const HTTP_PROXY_SERVER: &str = "HTTP proxy server";
pub const TCP_FORWARDING: &str = "TCP forwarding";
pub const UDP_FORWARDING: &str = "UDP forwarding";
pub const TCP_TPROXY: &str = "TCP transparent proxy";
pub const UDP_TPROXY: &str = "UDP transparent proxy";
pub const TCP_REDIRECT: &str = "TCP redirect";
pub const TUN: &str = "TUN";

/// Builds the body of every client mode.
pub trait ModeFactory: Send + Sync {
    fn socks5(&self, _config: Socks5Config, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(SOCKS5_SERVER)
    }

    fn http(&self, _config: HttpConfig, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(HTTP_PROXY_SERVER)
    }

    fn tcp_forwarding(
        &self,
        _entries: Vec<TcpForwardingEntry>,
        _tunnel: SharedTunnel,
    ) -> UnitFuture {
        unsupported(TCP_FORWARDING)
    }

    fn udp_forwarding(
        &self,
        _entries: Vec<UdpForwardingEntry>,
        _tunnel: SharedTunnel,
    ) -> UnitFuture {
        unsupported(UDP_FORWARDING)
    }

    fn tcp_tproxy(&self, _config: TcpTProxyConfig, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(TCP_TPROXY)
    }

    fn udp_tproxy(&self, _config: UdpTProxyConfig, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(UDP_TPROXY)
    }

    fn tcp_redirect(&self, _config: TcpRedirectConfig, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(TCP_REDIRECT)
    }

    fn tun(&self, _config: TunConfig, _tunnel: SharedTunnel) -> UnitFuture {
        unsupported(TUN)
    }
}

fn unsupported(mode: &'static str) -> UnitFuture {
    Box::pin(async move { Err(ModeError::Unsupported(mode).into()) })
}

/// Register one unit per configured mode section.
pub fn register_modes(
    config: &ClientConfig,
    tunnel: &SharedTunnel,
    factory: &dyn ModeFactory,
) -> ModeSupervisor {
    let mut supervisor = ModeSupervisor::new();

    if let Some(socks5) = &config.socks5 {
        supervisor.add(SOCKS5_SERVER, factory.socks5(socks5.clone(), Arc::clone(tunnel)));
    }
    if let Some(http) = &config.http {
        supervisor.add(HTTP_PROXY_SERVER, factory.http(http.clone(), Arc::clone(tunnel)));
    }
    if !config.tcp_forwarding.is_empty() {
        supervisor.add(
            TCP_FORWARDING,
            factory.tcp_forwarding(config.tcp_forwarding.clone(), Arc::clone(tunnel)),
        );
    }
    if !config.udp_forwarding.is_empty() {
        supervisor.add(
            UDP_FORWARDING,
            factory.udp_forwarding(config.udp_forwarding.clone(), Arc::clone(tunnel)),
        );
    }
    if let Some(tproxy) = &config.tcp_tproxy {
        supervisor.add(TCP_TPROXY, factory.tcp_tproxy(tproxy.clone(), Arc::clone(tunnel)));
    }
    if let Some(tproxy) = &config.udp_tproxy {
        supervisor.add(UDP_TPROXY, factory.udp_tproxy(tproxy.clone(), Arc::clone(tunnel)));
    }
    if let Some(redirect) = &config.tcp_redirect {
        supervisor.add(
            TCP_REDIRECT,
            factory.tcp_redirect(redirect.clone(), Arc::clone(tunnel)),
        );
    }
    if let Some(tun) = &config.tun {
        supervisor.add(TUN, factory.tun(tun.clone(), Arc::clone(tunnel)));
    }

    supervisor
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::MockTunnel;

    struct NoModes;
    impl ModeFactory for NoModes {}

    fn tunnel() -> SharedTunnel {
        Arc::new(MockTunnel::new())
    }

    #[test]
    fn registers_configured_sections_in_order() {
        let config = ClientConfig::from_json(
            r#"{
                "server": "s:443",
                "tun": {"name": "tl0"},
                "http": {"listen": "127.0.0.1:8080"},
                "socks5": {"listen": "127.0.0.1:1080"},
                "udpForwarding": [{"listen": "127.0.0.1:5300", "remote": "1.1.1.1:53"}],
                "tcpRedirect": {"listen": "127.0.0.1:3500"}
            }"#,
        )
        .unwrap();

        let supervisor = register_modes(&config, &tunnel(), &NoModes);
        assert_eq!(
            supervisor.names(),
            vec![SOCKS5_SERVER, HTTP_PROXY_SERVER, UDP_FORWARDING, TCP_REDIRECT, TUN]
        );
    }

    #[test]
    fn empty_config_registers_nothing() {
        let config = ClientConfig::from_json(r#"{"server": "s:443"}"#).unwrap();
        assert!(register_modes(&config, &tunnel(), &NoModes).is_empty());
    }

    #[tokio::test]
    async fn unimplemented_mode_fails_as_unsupported() {
        let config = ClientConfig::from_json(
            r#"{"server": "s:443", "tcpTProxy": {"listen": "127.0.0.1:2500"}}"#,
        )
        .unwrap();

        let outcome = register_modes(&config, &tunnel(), &NoModes).run().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.unit.as_deref(), Some(TCP_TPROXY));
        let error = outcome.error.unwrap();
        assert!(matches!(
            error.downcast_ref::<ModeError>(),
            Some(ModeError::Unsupported(TCP_TPROXY))
        ));
    }
}
