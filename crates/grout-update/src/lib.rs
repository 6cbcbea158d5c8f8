//! Self-update for Grout
//!
//! Looks up the newest release on the configured channel, downloads the
//! binary built for the running CFW next to the current executable and
//! swaps it in. The previous binary is kept as `<exe>.old` until the swap
//! has succeeded.

mod feed;
mod installer;
mod version;

pub use feed::{
    DEFAULT_FEED_URL, Release, ReleaseAsset, ReleaseFeed, accepts_prereleases, select_release,
};
pub use installer::{download_asset, sibling, swap_binary};
pub use version::{DEV_VERSION, Version, compare_versions, is_newer};

use grout_config::{Cfw, ReleaseChannel};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Update check failed: {0}")]
    CheckFailed(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Release {release} has no asset named {asset}")]
    NoAsset { release: String, asset: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    #[error("Installation failed: {0}")]
    InstallFailed(String),

    #[error("Installation failed: {install}; restoring the previous binary also failed: {restore}")]
    RollbackFailed { install: String, restore: String },

    #[error("An update check is already running")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Version of this build; untagged builds report `dev`
pub fn current_version() -> &'static str {
    option_env!("GROUT_VERSION").unwrap_or(DEV_VERSION)
}

/// A release newer than the running build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: String,
    pub asset: ReleaseAsset,
}

pub struct Updater {
    feed: ReleaseFeed,
    asset_name: String,
    channel: ReleaseChannel,
    exe: PathBuf,
    checking: AtomicBool,
}

struct CheckingGuard<'a>(&'a AtomicBool);

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Updater {
    pub fn new(feed: ReleaseFeed, cfw: Cfw, channel: ReleaseChannel, exe: impl Into<PathBuf>) -> Self {
        Self {
            feed,
            asset_name: cfw.release_asset_name(),
            channel,
            exe: exe.into(),
            checking: AtomicBool::new(false),
        }
    }

    /// Updater for the running executable against the public feed
    pub fn for_current_exe(cfw: Cfw, channel: ReleaseChannel) -> Result<Self> {
        Ok(Self::new(
            ReleaseFeed::new(DEFAULT_FEED_URL)?,
            cfw,
            channel,
            std::env::current_exe()?,
        ))
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::SeqCst)
    }

    /// Newest acceptable release if it is newer than `current`.
    ///
    /// `romm_version` decides the channel when following the server.
    pub async fn check(&self, current: &str, romm_version: Option<&str>) -> Result<Option<UpdateInfo>> {
        if self.checking.swap(true, Ordering::SeqCst) {
            return Err(UpdateError::Busy);
        }
        let _guard = CheckingGuard(&self.checking);

        if current.trim() == DEV_VERSION {
            tracing::debug!("Development build, skipping update check");
            return Ok(None);
        }

        let releases = self.feed.releases().await?;
        let allow_prerelease = accepts_prereleases(self.channel, romm_version);
        let Some(release) = select_release(&releases, allow_prerelease) else {
            tracing::debug!(channel = %self.channel, "No releases on channel");
            return Ok(None);
        };

        if !is_newer(current, &release.tag_name) {
            tracing::debug!(current, latest = %release.tag_name, "Already up to date");
            return Ok(None);
        }

        let asset = release
            .asset(&self.asset_name)
            .cloned()
            .ok_or_else(|| UpdateError::NoAsset {
                release: release.tag_name.clone(),
                asset: self.asset_name.clone(),
            })?;

        tracing::info!(current, latest = %release.tag_name, "Update available");
        Ok(Some(UpdateInfo {
            current_version: current.to_string(),
            latest_version: release.tag_name.clone(),
            asset,
        }))
    }

    /// Download, verify and swap in the update
    pub async fn apply(&self, update: &UpdateInfo, progress: impl FnMut(u64, u64) + Send) -> Result<()> {
        let staged = download_asset(self.feed.client(), &update.asset, &self.exe, progress).await?;

        let exe = self.exe.clone();
        let swapped = tokio::task::spawn_blocking(move || swap_binary(&exe, &staged))
            .await
            .map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        swapped?;

        tracing::info!(version = %update.latest_version, "Update installed");
        Ok(())
    }
}
