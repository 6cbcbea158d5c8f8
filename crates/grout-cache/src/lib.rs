//! Metadata cache for Grout
//!
//! An SQLite database under `.cache/grout.db` mirroring the RomM server's
//! platforms, games and collections, plus local bookkeeping: BIOS
//! availability, filename-to-ROM mappings, failed hash lookups, per-platform
//! sync status and refresh timestamps.
//!
//! Every write runs in its own transaction with `INSERT OR REPLACE`
//! semantics keyed on server ids, so repeated syncs are idempotent.

mod collections;
mod games;
mod mappings;
mod platforms;
mod schema;
mod status;
mod store;

pub use mappings::{FailedLookup, FilenameMapping};
pub use status::{PlatformSyncState, PlatformSyncStatus};
pub use store::{BulkLoadGuard, CacheOptions, CacheStats, CacheStore};

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Keys of the `cache_metadata` table
pub mod keys {
    pub const PLATFORMS_REFRESHED_AT: &str = "platforms_refreshed_at";
    pub const GAMES_REFRESHED_AT: &str = "games_refreshed_at";
    pub const COLLECTIONS_REFRESHED_AT: &str = "collections_refreshed_at";
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const HOST_IDENTITY: &str = "host_identity";
}

/// Kind of row an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Database,
    Platform,
    Game,
    Collection,
    Bios,
    FilenameMapping,
    FailedLookup,
    SyncStatus,
    Metadata,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Database => "database",
            Entity::Platform => "platform",
            Entity::Game => "game",
            Entity::Collection => "collection",
            Entity::Bios => "bios",
            Entity::FilenameMapping => "filename_mapping",
            Entity::FailedLookup => "failed_lookup",
            Entity::SyncStatus => "sync_status",
            Entity::Metadata => "metadata",
        })
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache not initialized")]
    NotInitialized,

    #[error("Cache miss: {entity} {key}")]
    Miss { entity: Entity, key: String },

    #[error("Cache database is closed")]
    Closed,

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("{op} {entity} [{key}]: {source}")]
    Operation {
        op: &'static str,
        entity: Entity,
        key: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub(crate) fn op(
        op: &'static str,
        entity: Entity,
        key: impl fmt::Display,
        source: rusqlite::Error,
    ) -> Self {
        CacheError::Operation {
            op,
            entity,
            key: key.to_string(),
            source,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss { .. })
    }
}

static GLOBAL: RwLock<Option<Arc<CacheStore>>> = RwLock::new(None);

/// Initialize the process-wide cache, or return the live one
pub fn init_global(host_identity: &str, options: CacheOptions) -> Result<Arc<CacheStore>, CacheError> {
    let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(store) = slot.as_ref() {
        return Ok(Arc::clone(store));
    }

    let store = Arc::new(CacheStore::initialize(host_identity, options)?);
    *slot = Some(Arc::clone(&store));
    Ok(store)
}

/// The process-wide cache
pub fn global() -> Result<Arc<CacheStore>, CacheError> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(CacheError::NotInitialized)
}

/// Close the process-wide cache so the next login re-initializes it
pub fn close_global() {
    let store = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(store) = store {
        store.close();
    }
}

/// Close the process-wide cache and delete its folder
pub fn delete_global_cache_folder() -> Result<(), CacheError> {
    let store = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
    match store {
        Some(store) => store.delete_cache_folder(),
        None => Ok(()),
    }
}
