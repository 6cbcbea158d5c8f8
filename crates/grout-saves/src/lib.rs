//! Save synchronisation between the handheld and RomM
//!
//! A run scans the CFW's ROM and save folders, pairs every local ROM with
//! its remote record, picks an action per ROM by comparing timestamps and
//! carries the actions out. Local ROMs that cannot be paired by filename
//! are reported as unmatched; [`OrphanMatcher`] resolves those by content
//! hash and remembers the answer.

mod engine;
mod orphan;
mod plan;
mod scan;
mod transfer;

pub use engine::{SaveSync, SaveSyncOptions, SyncPlan};
pub use orphan::{OrphanMatcher, OrphanOutcome, OrphanReport, crc32_file, sha1_file};
pub use plan::{SaveAction, SyncProposal, dedup_proposals, select_action};
pub use scan::{LocalRomFile, LocalSave, SAVE_EXTENSIONS, scan_local, strip_ext};
pub use transfer::{backup_name, upload_name};

use grout_cache::CacheError;
use grout_romm::RommError;
use std::path::PathBuf;
use thiserror::Error;

/// ROMs requested per page while pairing
pub const SAVE_SYNC_PAGE_SIZE: i64 = 100;

/// Transfers in flight at once
pub const TRANSFER_CONCURRENCY: usize = 4;

/// Hours before a failed hash lookup is retried
pub const LOOKUP_BACKOFF_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum SaveSyncError {
    #[error("RomM error: {0}")]
    Romm(#[from] RommError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No save folder configured for platform {0}")]
    NoSaveFolder(String),

    #[error("Proposal for ROM {0} has no save to transfer")]
    MissingSave(i64),

    #[error("No remote ROM matches {0}")]
    OrphanRom(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SaveSyncError>;

/// Outcome of one proposal, ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSyncResult {
    pub game_name: String,
    pub rom_display_name: String,
    pub action: SaveAction,
    pub success: bool,
    pub error: Option<String>,
    pub file_path: PathBuf,
}

/// A local save whose ROM could not be paired by filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedSave {
    pub platform_fs_slug: String,
    pub rom_file_name: String,
    pub rom_path: PathBuf,
    pub save_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSyncReport {
    pub results: Vec<SaveSyncResult>,
    pub unmatched: Vec<UnmatchedSave>,
}

impl SaveSyncReport {
    pub fn failures(&self) -> impl Iterator<Item = &SaveSyncResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn count(&self, action: SaveAction) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let result = |action, success| SaveSyncResult {
            game_name: "Zelda".into(),
            rom_display_name: "Zelda (USA)".into(),
            action,
            success,
            error: None,
            file_path: PathBuf::from("/saves/Zelda.srm"),
        };
        let report = SaveSyncReport {
            results: vec![
                result(SaveAction::Upload, true),
                result(SaveAction::Upload, false),
                result(SaveAction::Skip, true),
            ],
            unmatched: Vec::new(),
        };

        assert_eq!(report.count(SaveAction::Upload), 2);
        assert_eq!(report.count(SaveAction::Download), 0);
        assert_eq!(report.failures().count(), 1);
    }
}
