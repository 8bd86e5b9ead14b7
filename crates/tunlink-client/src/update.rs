//! One-shot update check run after the first tunnel handshake.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::modes::SharedTunnel;

/// Default update API endpoint.
pub const DEFAULT_UPDATE_URL: &str = "https://api.tunlink.dev";

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Work scheduled once the tunnel is first connected. Must never fail the
/// run; implementations log their own errors.
///
/// `tunnel` is the run's live tunnel, for actions that talk to the outside
/// through it.
#[async_trait]
pub trait PostConnectAction: Send + Sync {
    async fn run(&self, tunnel: SharedTunnel);
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Response of the update API.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub has_update: bool,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub url: String,
}

impl UpdateInfo {
    /// Trust the server's flag, but also catch a newer semver it forgot to
    /// flag.
    pub fn is_update_for(&self, current: &str) -> bool {
        self.has_update || is_newer(current, &self.latest_version)
    }
}

/// `true` if `latest` parses as a strictly higher semver than `current`.
fn is_newer(current: &str, latest: &str) -> bool {
    let strip = |v: &str| v.trim().trim_start_matches('v').to_string();
    match (
        semver::Version::parse(&strip(current)),
        semver::Version::parse(&strip(latest)),
    ) {
        (Ok(c), Ok(l)) => l > c,
        _ => false,
    }
}

/// Queries the update API for a newer client release.
///
/// Talks to the API directly with its own HTTP client, not through the
/// tunnel.
pub struct UpdateChecker {
    client: reqwest::Client,
    base_url: String,
    current_version: String,
    platform: &'static str,
    arch: &'static str,
}

impl UpdateChecker {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder().timeout(CHECK_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        })
    }

    /// Override the version reported to the API.
    #[must_use]
    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }

    pub async fn check(&self) -> Result<UpdateInfo, UpdateError> {
        let info = self
            .client
            .get(format!("{}/v1/update", self.base_url))
            .query(&[
                ("cver", self.current_version.as_str()),
                ("plat", self.platform),
                ("arch", self.arch),
                ("side", "client"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<UpdateInfo>()
            .await?;
        Ok(info)
    }
}

#[async_trait]
impl PostConnectAction for UpdateChecker {
    async fn run(&self, _tunnel: SharedTunnel) {
        match self.check().await {
            Ok(update) if update.is_update_for(&self.current_version) => {
                info!(
                    current = %self.current_version,
                    latest = %update.latest_version,
                    url = %update.url,
                    "Update available"
                );
            }
            Ok(_) => debug!(current = %self.current_version, "No update available"),
            Err(e) => warn!(error = %e, "Failed to check for update"),
        }
    }
}
