//! On-disk layout relative to the process working directory
//!
//! ```text
//! .cache/grout.db
//! .cache/artwork/<slug>/<rom_id>.png
//! .tmp/
//! config.json
//! grout.log
//! ```

use std::path::{Path, PathBuf};

pub const CACHE_DIR_NAME: &str = ".cache";
pub const TMP_DIR_NAME: &str = ".tmp";
pub const ARTWORK_DIR_NAME: &str = "artwork";
pub const DATABASE_FILE_NAME: &str = "grout.db";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = "grout.log";

/// Working directory, or the OS temp directory when there is none
pub fn working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir())
}

pub fn cache_dir() -> PathBuf {
    cache_dir_in(&working_dir())
}

pub fn cache_dir_in(root: &Path) -> PathBuf {
    root.join(CACHE_DIR_NAME)
}

pub fn artwork_dir_in(root: &Path) -> PathBuf {
    cache_dir_in(root).join(ARTWORK_DIR_NAME)
}

pub fn artwork_dir() -> PathBuf {
    artwork_dir_in(&working_dir())
}

pub fn tmp_dir() -> PathBuf {
    working_dir().join(TMP_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    working_dir().join(CONFIG_FILE_NAME)
}

pub fn log_path() -> PathBuf {
    working_dir().join(LOG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let root = Path::new("/mnt/SDCARD/Tools/grout");
        assert_eq!(cache_dir_in(root), root.join(".cache"));
        assert_eq!(artwork_dir_in(root), root.join(".cache").join("artwork"));
    }
}
