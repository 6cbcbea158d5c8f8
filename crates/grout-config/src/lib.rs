//! Configuration management for Grout
//!
//! Handles the user's `config.json`, the process environment (`CFW`,
//! `BASE_PATH`, ...), the on-disk layout relative to the working directory,
//! and the interface through which CFW folder tables are consulted.

mod duration;
mod environment;
mod host;
mod layout;
pub mod paths;
mod settings;

pub use environment::{Cfw, Environment};
pub use host::Host;
pub use layout::{CfwLayout, FolderTable};
pub use settings::{
    ArtKind, CollectionView, Config, DirectoryMapping, DownloadedGamesMode, LogLevel,
    ReleaseChannel, SaveSyncMode,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown CFW: {0}")]
    UnknownCfw(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
