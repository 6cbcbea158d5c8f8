//! Action selection

use crate::scan::LocalRomFile;
use chrono::{DateTime, Utc};
use grout_romm::Save;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveAction {
    Download,
    Upload,
    Skip,
}

impl SaveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveAction::Download => "download",
            SaveAction::Upload => "upload",
            SaveAction::Skip => "skip",
        }
    }
}

impl fmt::Display for SaveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a direction from the local save's mtime and the newest remote save.
///
/// Timestamps are compared at whole-second precision; equal times skip.
pub fn select_action(local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> SaveAction {
    match (local.map(|t| t.timestamp()), remote.map(|t| t.timestamp())) {
        (None, Some(_)) => SaveAction::Download,
        (Some(_), None) => SaveAction::Upload,
        (Some(l), Some(r)) if r > l => SaveAction::Download,
        (Some(l), Some(r)) if l > r => SaveAction::Upload,
        _ => SaveAction::Skip,
    }
}

/// One paired ROM and what to do with its save
#[derive(Debug, Clone, PartialEq)]
pub struct SyncProposal {
    pub rom_id: i64,
    pub rom_name: String,
    pub local: LocalRomFile,
    /// Newest remote save for the ROM
    pub remote: Option<Save>,
    pub action: SaveAction,
}

impl SyncProposal {
    pub fn new(rom_id: i64, rom_name: impl Into<String>, local: LocalRomFile, remote: Option<Save>) -> Self {
        let action = select_action(
            local.save.as_ref().map(|s| s.last_modified),
            remote.as_ref().map(|s| s.updated_at),
        );
        Self {
            rom_id,
            rom_name: rom_name.into(),
            local,
            remote,
            action,
        }
    }

    /// File the action reads or replaces
    pub fn local_save_path(&self) -> Option<&PathBuf> {
        self.local.save.as_ref().map(|s| &s.path)
    }
}

#[derive(Hash, PartialEq, Eq)]
enum DedupKey {
    Path(PathBuf),
    Rom(i64),
}

/// Drop proposals that would touch the same save twice.
///
/// Uploads are keyed by local save path, downloads and skips by ROM id.
/// The first proposal for a key wins.
pub fn dedup_proposals(proposals: Vec<SyncProposal>) -> Vec<SyncProposal> {
    let mut seen = HashSet::new();
    proposals
        .into_iter()
        .filter(|p| {
            let key = match (p.action, p.local_save_path()) {
                (SaveAction::Upload, Some(path)) => DedupKey::Path(path.clone()),
                _ => DedupKey::Rom(p.rom_id),
            };
            seen.insert((p.action, key))
        })
        .collect()
}
