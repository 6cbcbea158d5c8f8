//! Hash-based matching for ROMs the server knows under another name

use crate::scan::strip_ext;
use crate::{LOOKUP_BACKOFF_HOURS, Result, SaveSyncError, UnmatchedSave};
use grout_cache::CacheStore;
use grout_romm::{Rom, RomHash, RommApi};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Uppercase CRC32 of the whole file, as RomM stores it
pub fn crc32_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = crc32fast::Hasher::new();
    read_chunks(path, |chunk| hasher.update(chunk))?;
    Ok(format!("{:08X}", hasher.finalize()))
}

/// Lowercase hex SHA-1 of the whole file
pub fn sha1_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha1::new();
    read_chunks(path, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

fn read_chunks(path: &Path, mut f: impl FnMut(&[u8])) -> std::io::Result<()> {
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        f(&buf[..n]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanOutcome {
    /// A filename mapping already exists; nothing was hashed
    AlreadyMapped { rom_id: i64 },
    /// A recent lookup failed; nothing was hashed
    BackedOff,
    Matched { rom_id: i64, rom_name: String },
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub matched: usize,
    pub not_found: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Resolves unmatched local ROMs by CRC32, then SHA-1
pub struct OrphanMatcher {
    api: Arc<dyn RommApi>,
    store: Arc<CacheStore>,
    backoff: chrono::Duration,
}

impl OrphanMatcher {
    pub fn new(api: Arc<dyn RommApi>, store: Arc<CacheStore>) -> Self {
        Self {
            api,
            store,
            backoff: chrono::Duration::hours(LOOKUP_BACKOFF_HOURS),
        }
    }

    pub fn with_backoff(mut self, backoff: chrono::Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Try to identify one local ROM file
    pub async fn match_file(&self, platform_fs_slug: &str, path: &Path) -> Result<OrphanOutcome> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SaveSyncError::OrphanRom(path.display().to_string()))?;
        let base = strip_ext(&file_name);

        if let Some(mapping) = self.store.get_filename_mapping(platform_fs_slug, base)? {
            return Ok(OrphanOutcome::AlreadyMapped { rom_id: mapping.rom_id });
        }
        if !self.store.should_retry_lookup(platform_fs_slug, base, self.backoff)? {
            tracing::debug!(file = %file_name, "Hash lookup backed off");
            return Ok(OrphanOutcome::BackedOff);
        }

        match self.lookup(path).await {
            Ok(Some(rom)) => {
                self.store.save_filename_mapping(platform_fs_slug, base, rom.id, &rom.name)?;
                tracing::info!(file = %file_name, rom_id = rom.id, rom = %rom.name, "Matched ROM by hash");
                Ok(OrphanOutcome::Matched {
                    rom_id: rom.id,
                    rom_name: rom.name,
                })
            }
            Ok(None) => {
                self.store.record_failed_lookup(platform_fs_slug, base)?;
                tracing::debug!(file = %file_name, "No ROM matches by hash");
                Ok(OrphanOutcome::NotFound)
            }
            Err(e) => {
                self.store.record_failed_lookup(platform_fs_slug, base)?;
                Err(e)
            }
        }
    }

    /// Match every unmatched save's ROM file
    pub async fn match_all(&self, unmatched: &[UnmatchedSave]) -> OrphanReport {
        let mut report = OrphanReport::default();
        for orphan in unmatched {
            match self.match_file(&orphan.platform_fs_slug, &orphan.rom_path).await {
                Ok(OrphanOutcome::Matched { .. }) => report.matched += 1,
                Ok(OrphanOutcome::NotFound) => report.not_found += 1,
                Ok(OrphanOutcome::AlreadyMapped { .. } | OrphanOutcome::BackedOff) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(file = %orphan.rom_file_name, error = %e, "Orphan lookup failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn lookup(&self, path: &Path) -> Result<Option<Rom>> {
        let crc = hash_blocking(path.to_path_buf(), crc32_file).await?;
        if let Some(rom) = self.api.rom_by_hash(&RomHash::Crc(crc)).await? {
            return Ok(Some(rom));
        }

        let sha1 = hash_blocking(path.to_path_buf(), sha1_file).await?;
        Ok(self.api.rom_by_hash(&RomHash::Sha1(sha1)).await?)
    }
}

async fn hash_blocking(path: PathBuf, f: fn(&Path) -> std::io::Result<String>) -> Result<String> {
    tokio::task::spawn_blocking(move || f(&path))
        .await
        .map_err(|e| SaveSyncError::Task(e.to_string()))?
        .map_err(SaveSyncError::from)
}
