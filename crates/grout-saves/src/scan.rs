//! Local ROM and save discovery

use chrono::{DateTime, Utc};
use grout_config::CfwLayout;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions treated as battery saves
pub const SAVE_EXTENSIONS: &[&str] = &[
    "srm", "sav", "sa1", "sa2", "sra", "eep", "fla", "mpk", "mcr", "mcd", "brm", "bkr", "dsv", "rtc",
];

/// A save file found under the CFW's save root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSave {
    pub path: PathBuf,
    pub file_name: String,
    pub last_modified: DateTime<Utc>,
    /// Emulator folder the save sits in
    pub emulator: String,
}

/// A ROM file found under the CFW's ROM root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRomFile {
    pub platform_fs_slug: String,
    pub file_name: String,
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub save: Option<LocalSave>,
}

impl LocalRomFile {
    /// File name without its extension, as used for remote lookups
    pub fn base_name(&self) -> &str {
        strip_ext(&self.file_name)
    }
}

/// Drop a trailing file extension.
///
/// Only a short alphanumeric suffix containing a letter counts, so titles
/// such as `Super Mario Bros. 3` or `Game v1.1` keep their dots.
pub fn strip_ext(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, ext))
            if !base.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic()) =>
        {
            base
        }
        _ => name,
    }
}

/// Scan every platform the layout knows about, one thread per platform
pub fn scan_local(layout: &dyn CfwLayout) -> Vec<LocalRomFile> {
    let slugs = layout.platform_slugs();

    let mut found: Vec<LocalRomFile> = std::thread::scope(|scope| {
        let handles: Vec<_> = slugs
            .iter()
            .map(|slug| scope.spawn(move || scan_platform(layout, slug)))
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    found.sort_by(|a, b| {
        a.platform_fs_slug
            .cmp(&b.platform_fs_slug)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });

    tracing::debug!(
        roms = found.len(),
        saves = found.iter().filter(|r| r.save.is_some()).count(),
        "Local scan finished"
    );
    found
}

fn scan_platform(layout: &dyn CfwLayout, slug: &str) -> Vec<LocalRomFile> {
    let saves = scan_saves(layout.save_root(), &layout.save_folders(slug));

    let mut roms = Vec::new();
    for folder in layout.rom_folders(slug) {
        let dir = layout.rom_root().join(&folder);
        for path in list_files(&dir) {
            let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let Some(last_modified) = modified(&path) else {
                continue;
            };
            let save = saves.get(strip_ext(&file_name)).cloned();

            roms.push(LocalRomFile {
                platform_fs_slug: slug.to_string(),
                file_name,
                path,
                last_modified,
                save,
            });
        }
    }
    roms
}

/// Saves keyed by base name; the newest wins when several folders hold one
fn scan_saves(save_root: &Path, folders: &[String]) -> HashMap<String, LocalSave> {
    let per_folder: Vec<Vec<LocalSave>> = std::thread::scope(|scope| {
        let handles: Vec<_> = folders
            .iter()
            .map(|folder| scope.spawn(move || scan_save_folder(save_root, folder)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let mut saves: HashMap<String, LocalSave> = HashMap::new();
    for save in per_folder.into_iter().flatten() {
        let key = strip_ext(&save.file_name).to_string();
        match saves.get(&key) {
            Some(existing) if existing.last_modified >= save.last_modified => {}
            _ => {
                saves.insert(key, save);
            }
        }
    }
    saves
}

fn scan_save_folder(save_root: &Path, folder: &str) -> Vec<LocalSave> {
    list_files(&save_root.join(folder))
        .into_iter()
        .filter(|path| is_save_file(path))
        .filter_map(|path| {
            Some(LocalSave {
                file_name: path.file_name()?.to_string_lossy().into_owned(),
                last_modified: modified(&path)?,
                emulator: folder.to_string(),
                path,
            })
        })
        .collect()
}

/// Visible regular files directly inside `dir`
fn list_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.into_path())
        .collect()
}

fn is_save_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SAVE_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}

pub(crate) fn modified(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from)
}
