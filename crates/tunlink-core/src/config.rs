//! Client configuration for tunlink.
//!
//! A single JSON document describes the tunnel transport and every local
//! front-end ("mode") the client should expose on top of it:
//! 1. Transport section (flattened at the top level: `server`, `auth`, ...)
//! 2. Optional mode sections (`socks5`, `http`, `tcpForwarding`, ...)
//! 3. Process flags (`lazy`, `disableUpdateCheck`)
//! 4. Environment variable overrides (highest priority)
//!
//! A missing mode section means that mode is not started.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

/// Complete client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks5: Option<Socks5Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_forwarding: Vec<TcpForwardingEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub udp_forwarding: Vec<UdpForwardingEntry>,
    #[serde(
        default,
        rename = "tcpTProxy",
        skip_serializing_if = "Option::is_none"
    )]
    pub tcp_tproxy: Option<TcpTProxyConfig>,
    #[serde(
        default,
        rename = "udpTProxy",
        skip_serializing_if = "Option::is_none"
    )]
    pub udp_tproxy: Option<UdpTProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_redirect: Option<TcpRedirectConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tun: Option<TunConfig>,

    /// Defer the tunnel handshake until the first connection needs it.
    #[serde(default)]
    pub lazy: bool,
    /// Skip the one-shot update check after the first handshake.
    #[serde(default)]
    pub disable_update_check: bool,
}

/// Transport section. Only `server` is interpreted here; everything else is
/// handed to the transport implementation untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Socks5Config {
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub disable_udp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpForwardingEntry {
    pub listen: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpForwardingEntry {
    pub listen: String,
    pub remote: String,
    /// Idle session timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpTProxyConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpTProxyConfig {
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpRedirectConfig {
    pub listen: String,
}

/// Virtual network interface settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<TunAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TunAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl ClientConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values that would make the client fail later in
    /// a less obvious way.
    pub fn validate(&self) -> Result<()> {
        if self.transport.server.trim().is_empty() {
            return Err(Error::Config("server address is required".into()));
        }
        if let Some(socks5) = &self.socks5 {
            validate_listen("socks5", &socks5.listen)?;
        }
        if let Some(http) = &self.http {
            validate_listen("http", &http.listen)?;
        }
        for entry in &self.tcp_forwarding {
            validate_listen("tcpForwarding", &entry.listen)?;
            validate_remote("tcpForwarding", &entry.remote)?;
        }
        for entry in &self.udp_forwarding {
            validate_listen("udpForwarding", &entry.listen)?;
            validate_remote("udpForwarding", &entry.remote)?;
        }
        if let Some(tproxy) = &self.tcp_tproxy {
            validate_listen("tcpTProxy", &tproxy.listen)?;
        }
        if let Some(tproxy) = &self.udp_tproxy {
            validate_listen("udpTProxy", &tproxy.listen)?;
        }
        if let Some(redirect) = &self.tcp_redirect {
            validate_listen("tcpRedirect", &redirect.listen)?;
        }
        if let Some(tun) = &self.tun {
            if tun.name.trim().is_empty() {
                return Err(Error::Config("tun: interface name is required".into()));
            }
        }
        Ok(())
    }

    /// Whether no mode section is configured at all.
    pub fn has_no_modes(&self) -> bool {
        self.socks5.is_none()
            && self.http.is_none()
            && self.tcp_forwarding.is_empty()
            && self.udp_forwarding.is_empty()
            && self.tcp_tproxy.is_none()
            && self.udp_tproxy.is_none()
            && self.tcp_redirect.is_none()
            && self.tun.is_none()
    }
}

/// Listen addresses are handed to the mode as-is, so hostnames such as
/// `localhost:1080` are fine as long as the port is valid.
fn validate_listen(section: &str, listen: &str) -> Result<()> {
    if listen.parse::<SocketAddr>().is_ok() || is_host_port(listen) {
        return Ok(());
    }
    Err(Error::Config(format!(
        "{section}: invalid listen address {listen:?}"
    )))
}

fn validate_remote(section: &str, remote: &str) -> Result<()> {
    if is_host_port(remote) {
        return Ok(());
    }
    Err(Error::Config(format!(
        "{section}: invalid remote address {remote:?}"
    )))
}

fn is_host_port(addr: &str) -> bool {
    matches!(
        addr.rsplit_once(':'),
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
    )
}

/// Load a client config file, apply environment overrides, and validate.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let mut config: ClientConfig = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Apply `TUNLINK_*` overrides. `lookup` abstracts the environment so the
/// override rules can be exercised without mutating process state.
pub fn apply_env_overrides(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TUNLINK_DISABLE_UPDATE_CHECK").and_then(|v| parse_flag(&v)) {
        config.disable_update_check = val;
    }
    if let Some(val) = lookup("TUNLINK_LAZY").and_then(|v| parse_flag(&v)) {
        config.lazy = val;
    }
    if let Some(val) = lookup("TUNLINK_SERVER") {
        config.transport.server = val;
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
