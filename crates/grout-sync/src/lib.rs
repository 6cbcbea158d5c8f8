//! Background synchronisation for Grout
//!
//! Two cooperating services keep the local cache in step with the RomM
//! server:
//!
//! - [`FreshnessOracle`] answers "do we need to refetch X?" from a
//!   session-local map filled by a startup check pass
//! - [`SyncEngine`] runs full, collections-only and per-platform syncs on a
//!   single worker with a coalescing request queue

mod engine;
mod freshness;
mod icon;

pub use engine::{SyncEngine, SyncOptions, SyncRequest};
pub use freshness::{CacheKey, FreshnessOracle};
pub use icon::SyncIcon;

use grout_cache::CacheError;
use grout_romm::RommError;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Fan-out width for per-platform work
pub const SYNC_CONCURRENCY: usize = 5;

/// ROMs requested per page while syncing
pub const SYNC_PAGE_SIZE: i64 = 200;

/// Share of the progress bar reserved for the games phase
pub const GAMES_PROGRESS_CAP: f32 = 0.90;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("RomM error: {0}")]
    Romm(#[from] RommError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Sync stopped")]
    Stopped,

    #[error("Sync task panicked: {0}")]
    Panicked(String),
}

static ORACLE: RwLock<Option<Arc<FreshnessOracle>>> = RwLock::new(None);

/// Install the process-wide oracle, or return the live one
pub fn init_oracle(oracle: FreshnessOracle) -> Arc<FreshnessOracle> {
    let mut slot = ORACLE.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = slot.as_ref() {
        return Arc::clone(existing);
    }
    let oracle = Arc::new(oracle);
    *slot = Some(Arc::clone(&oracle));
    oracle
}

/// The process-wide oracle, if one was installed
pub fn oracle() -> Option<Arc<FreshnessOracle>> {
    ORACLE.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Drop the process-wide oracle so the next login starts fresh
pub fn reset_oracle() {
    ORACLE.write().unwrap_or_else(PoisonError::into_inner).take();
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
