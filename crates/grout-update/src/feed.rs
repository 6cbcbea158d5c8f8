//! Release feed access

use crate::version::Version;
use crate::{Result, UpdateError};
use grout_config::ReleaseChannel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where published releases are listed
pub const DEFAULT_FEED_URL: &str = "https://api.github.com/repos/rommapp/grout/releases";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    /// `sha256:<hex>` when the feed publishes one
    #[serde(default)]
    pub digest: Option<String>,
}

impl ReleaseAsset {
    /// Expected SHA-256 in lowercase hex
    pub fn sha256(&self) -> Option<String> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix("sha256:"))
            .map(|hex| hex.trim().to_ascii_lowercase())
            .filter(|hex| !hex.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn version(&self) -> Option<Version> {
        self.tag_name.parse().ok()
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease || self.version().is_some_and(|v| v.is_prerelease())
    }

    pub fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

/// Whether prereleases count for `channel`; `match_romm` follows the server
pub fn accepts_prereleases(channel: ReleaseChannel, romm_version: Option<&str>) -> bool {
    match channel {
        ReleaseChannel::Stable => false,
        ReleaseChannel::Beta => true,
        ReleaseChannel::MatchRomm => romm_version
            .and_then(|v| v.parse::<Version>().ok())
            .is_some_and(|v| v.is_prerelease()),
    }
}

/// Newest published release the channel accepts
pub fn select_release(releases: &[Release], allow_prerelease: bool) -> Option<&Release> {
    releases
        .iter()
        .filter(|r| !r.draft)
        .filter(|r| allow_prerelease || !r.is_prerelease())
        .filter_map(|r| r.version().map(|v| (v, r)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, r)| r)
}

pub struct ReleaseFeed {
    url: String,
    client: reqwest::Client,
}

impl ReleaseFeed {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("Grout/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn releases(&self) -> Result<Vec<Release>> {
        tracing::debug!("Fetching releases from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpdateError::CheckFailed(format!(
                "Release feed returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| UpdateError::CheckFailed(e.to_string()))
    }
}
