//! File-level helpers for moving saves

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::path::{Path, PathBuf};

/// Backups live next to the save they protect
pub const BACKUP_DIR_NAME: &str = ".backup";

fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, ext),
        _ => (file_name, ""),
    }
}

/// `<base> [YYYY-MM-DD HH-MM-SS].<ext>`
pub fn backup_name(file_name: &str, at: DateTime<Utc>) -> String {
    let (base, ext) = split_name(file_name);
    let stamp = at.format("%Y-%m-%d %H-%M-%S");
    if ext.is_empty() {
        format!("{base} [{stamp}]")
    } else {
        format!("{base} [{stamp}].{ext}")
    }
}

/// `<base> [YYYY-MM-DD HH-MM-SS-mmm].<ext>`, stamped with the save's own mtime
pub fn upload_name(file_name: &str, modified: DateTime<Utc>) -> String {
    let (base, ext) = split_name(file_name);
    let stamp = modified.format("%Y-%m-%d %H-%M-%S-%3f");
    if ext.is_empty() {
        format!("{base} [{stamp}]")
    } else {
        format!("{base} [{stamp}].{ext}")
    }
}

/// Copy `save` into its folder's `.backup/` directory
pub(crate) async fn backup(save: &Path, now: DateTime<Utc>) -> std::io::Result<PathBuf> {
    let dir = save
        .parent()
        .map(|p| p.join(BACKUP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(BACKUP_DIR_NAME));
    tokio::fs::create_dir_all(&dir).await?;

    let name = save
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = dir.join(backup_name(&name, now));
    tokio::fs::copy(save, &target).await?;
    Ok(target)
}

/// Write downloaded save bytes with `0644` permissions
pub(crate) async fn write_save(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

pub(crate) fn set_mtime(path: &Path, at: DateTime<Utc>) -> std::io::Result<()> {
    let time = FileTime::from_unix_time(at.timestamp(), at.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, time)
}

/// Scratch directory for one upload, so saves sharing a file name never meet
pub(crate) fn upload_scratch_dir(tmp_dir: &Path, rom_id: i64, emulator: &str) -> PathBuf {
    let emulator: String = emulator
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    tmp_dir.join(format!("{rom_id}-{emulator}"))
}

/// Scratch copy removed, with its directory, when dropped
pub(crate) struct TempCopy {
    path: PathBuf,
}

impl TempCopy {
    pub(crate) async fn create(source: &Path, dir: &Path, name: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        tokio::fs::copy(source, &path).await?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempCopy {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove temp save");
        }
        // Only succeeds once the directory is empty
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}
