//! Interface to the CFW-specific directory tables

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a CFW keeps ROMs and saves for each platform
///
/// The concrete tables are shipped alongside each CFW build; the sync and
/// save-sync engines only ever consult them through this trait.
pub trait CfwLayout: Send + Sync {
    /// Base directory holding one folder per platform
    fn rom_root(&self) -> &Path;

    /// Base directory holding one folder per emulator
    fn save_root(&self) -> &Path;

    /// Candidate ROM folders (relative to `rom_root`) for a platform
    fn rom_folders(&self, fs_slug: &str) -> Vec<String>;

    /// Emulator save folders (relative to `save_root`) for a platform,
    /// preferred folder first
    fn save_folders(&self, fs_slug: &str) -> Vec<String>;

    /// Every platform slug the layout knows about
    fn platform_slugs(&self) -> Vec<String>;
}

/// Table-driven layout
#[derive(Debug, Clone, Default)]
pub struct FolderTable {
    pub rom_root: PathBuf,
    pub save_root: PathBuf,
    pub rom_folders: HashMap<String, Vec<String>>,
    pub save_folders: HashMap<String, Vec<String>>,
}

impl FolderTable {
    pub fn new(rom_root: impl Into<PathBuf>, save_root: impl Into<PathBuf>) -> Self {
        Self {
            rom_root: rom_root.into(),
            save_root: save_root.into(),
            ..Default::default()
        }
    }

    pub fn with_platform(mut self, fs_slug: &str, roms: &[&str], saves: &[&str]) -> Self {
        self.rom_folders
            .insert(fs_slug.to_string(), roms.iter().map(|s| s.to_string()).collect());
        self.save_folders
            .insert(fs_slug.to_string(), saves.iter().map(|s| s.to_string()).collect());
        self
    }
}

impl CfwLayout for FolderTable {
    fn rom_root(&self) -> &Path {
        &self.rom_root
    }

    fn save_root(&self) -> &Path {
        &self.save_root
    }

    fn rom_folders(&self, fs_slug: &str) -> Vec<String> {
        self.rom_folders.get(fs_slug).cloned().unwrap_or_default()
    }

    fn save_folders(&self, fs_slug: &str) -> Vec<String> {
        self.save_folders.get(fs_slug).cloned().unwrap_or_default()
    }

    fn platform_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.rom_folders.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_table_lookup() {
        let table = FolderTable::new("/roms", "/saves")
            .with_platform("gba", &["GBA"], &["mGBA", "gpSP"])
            .with_platform("snes", &["SFC", "SNES"], &["Snes9x"]);

        assert_eq!(table.rom_folders("snes"), vec!["SFC", "SNES"]);
        assert_eq!(table.save_folders("gba")[0], "mGBA");
        assert!(table.save_folders("n64").is_empty());
        assert_eq!(table.platform_slugs(), vec!["gba", "snes"]);
        assert_eq!(table.rom_root(), Path::new("/roms"));
    }
}
