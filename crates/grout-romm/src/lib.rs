//! RomM API client for Grout
//!
//! A typed, retry-tolerant wrapper over the RomM HTTP API. Transport
//! failures are classified once, at the HTTP boundary, into [`RommError`]
//! and flow up unchanged.
//!
//! Engines never hold a [`RommClient`] directly; they take an
//! `Arc<dyn RommApi>` so the transport can be swapped.

mod classify;
mod client;
mod download;
pub mod mock;
mod models;
mod paginate;

pub use classify::{classify_error, classify_source};
pub use client::{BasicAuth, RommClient};
pub use download::{DownloadJob, DownloadManager, DownloadOutcome, HostCredentials, same_origin};
pub use paginate::fetch_all_roms;
pub use models::{
    Collection, CollectionId, CollectionKind, Device, DeviceRegistration, Firmware, Heartbeat,
    HeartbeatSystem, Platform, PlatformBinding, Rom, RomFile, RomHash, RomPage, RomQuery, Save, SaveQuery,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

pub type Result<T, E = RommError> = std::result::Result<T, E>;

/// Closed set of failures surfaced by the client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RommError {
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Wrong protocol: requested {requested}, server expects {correct}")]
    WrongProtocol { requested: String, correct: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Server error: {0}")]
    ServerError(u16),

    #[error("Save conflict with save {save_id}")]
    Conflict {
        save_id: i64,
        server_updated_at: Option<DateTime<Utc>>,
        message: String,
    },

    #[error("Unexpected HTTP status: {0}")]
    Http(u16),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl RommError {
    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => RommError::Unauthorized,
            403 => RommError::Forbidden,
            500..=599 => RommError::ServerError(status),
            other => RommError::Http(other),
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RommError::Timeout
                | RommError::ConnectionRefused(_)
                | RommError::ServerError(_)
                | RommError::Request(_)
        )
    }
}

impl From<std::io::Error> for RommError {
    fn from(err: std::io::Error) -> Self {
        RommError::Io(err.to_string())
    }
}

/// Observable surface of the RomM server
#[async_trait]
pub trait RommApi: Send + Sync {
    /// `GET /api/heartbeat`
    async fn heartbeat(&self) -> Result<Heartbeat>;

    /// `POST /api/login`
    async fn login(&self) -> Result<()>;

    /// `GET /api/config` platform bindings
    async fn platform_binding(&self) -> Result<PlatformBinding>;

    /// `GET /api/platforms`
    async fn platforms(&self, updated_after: Option<DateTime<Utc>>) -> Result<Vec<Platform>>;

    /// `GET /api/roms`
    async fn roms(&self, query: &RomQuery) -> Result<RomPage>;

    /// `GET /api/roms/by-hash`; `None` when the server knows no such ROM
    async fn rom_by_hash(&self, hash: &RomHash) -> Result<Option<Rom>>;

    /// `GET /api/roms/{id}`
    async fn rom(&self, id: i64) -> Result<Rom>;

    /// Regular, smart or virtual collections
    async fn collections(
        &self,
        kind: CollectionKind,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Collection>>;

    /// `GET /api/firmware?platform_id=`
    async fn firmware(&self, platform_id: i64) -> Result<Vec<Firmware>>;

    /// `GET /api/saves`
    async fn saves(&self, query: &SaveQuery) -> Result<Vec<Save>>;

    /// Raw contents of a remote save
    async fn download_save(&self, save: &Save) -> Result<Vec<u8>>;

    /// Multipart `POST /api/saves`; returns the stored save
    async fn upload_save(&self, rom_id: i64, emulator: &str, file: &Path) -> Result<Save>;

    /// `POST /api/devices`
    async fn register_device(&self, device: &DeviceRegistration) -> Result<Device>;

    /// Base URL all relative asset paths resolve against
    fn base_url(&self) -> &str;

    /// Credentials for out-of-band downloads (artwork, ROM binaries)
    fn auth(&self) -> Option<BasicAuth>;
}
