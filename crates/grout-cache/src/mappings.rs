//! Filename mappings and the failed-lookup ledger
//!
//! A mapping records that a renamed local file was resolved (by hash) to a
//! server ROM. A failed lookup records that the server did not know the
//! file, so the next attempt can back off.

use crate::store::CacheStore;
use crate::{CacheError, Entity};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};

/// A local file resolved to a server ROM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameMapping {
    pub platform_fs_slug: String,
    pub local_filename_no_ext: String,
    pub rom_id: i64,
    pub rom_name: String,
    pub matched_at: DateTime<Utc>,
}

/// Last unsuccessful hash lookup for a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLookup {
    pub platform_fs_slug: String,
    pub local_filename_no_ext: String,
    pub last_attempt: DateTime<Utc>,
    pub attempts: i64,
}

impl CacheStore {
    pub fn save_filename_mapping(
        &self,
        platform_fs_slug: &str,
        local_filename_no_ext: &str,
        rom_id: i64,
        rom_name: &str,
    ) -> Result<(), CacheError> {
        self.write(
            "save",
            Entity::FilenameMapping,
            format!("{platform_fs_slug}/{local_filename_no_ext}"),
            |tx| {
                tx.execute(
                    r#"INSERT INTO filename_mappings
                       (platform_fs_slug, local_filename_no_ext, rom_id, rom_name, matched_at)
                       VALUES (?1, ?2, ?3, ?4, ?5)
                       ON CONFLICT (platform_fs_slug, local_filename_no_ext) DO UPDATE SET
                           rom_id = excluded.rom_id,
                           rom_name = excluded.rom_name,
                           matched_at = excluded.matched_at"#,
                    params![platform_fs_slug, local_filename_no_ext, rom_id, rom_name, Utc::now()],
                )?;
                // a resolved file no longer needs backing off
                tx.execute(
                    "DELETE FROM failed_lookups WHERE platform_fs_slug = ?1 AND local_filename_no_ext = ?2",
                    params![platform_fs_slug, local_filename_no_ext],
                )?;
                Ok(())
            },
        )
    }

    pub fn get_filename_mapping(
        &self,
        platform_fs_slug: &str,
        local_filename_no_ext: &str,
    ) -> Result<Option<FilenameMapping>, CacheError> {
        self.read(
            "get",
            Entity::FilenameMapping,
            format!("{platform_fs_slug}/{local_filename_no_ext}"),
            |conn| {
                conn.query_row(
                    r#"SELECT platform_fs_slug, local_filename_no_ext, rom_id, rom_name, matched_at
                       FROM filename_mappings
                       WHERE platform_fs_slug = ?1 AND local_filename_no_ext = ?2"#,
                    params![platform_fs_slug, local_filename_no_ext],
                    |row| {
                        Ok(FilenameMapping {
                            platform_fs_slug: row.get(0)?,
                            local_filename_no_ext: row.get(1)?,
                            rom_id: row.get(2)?,
                            rom_name: row.get(3)?,
                            matched_at: row.get(4)?,
                        })
                    },
                )
                .optional()
            },
        )
    }

    /// Drop mappings on `platform_fs_slugs` whose ROM is no longer cached.
    ///
    /// Only pass platforms whose games were just refreshed; a platform whose
    /// fetch failed may be missing games that its mappings still point at.
    pub fn prune_stale_mappings(&self, platform_fs_slugs: &[&str]) -> Result<usize, CacheError> {
        if platform_fs_slugs.is_empty() {
            return Ok(0);
        }
        let pruned = self.write("prune", Entity::FilenameMapping, platform_fs_slugs.join(","), |tx| {
            let mut stmt = tx.prepare(
                r#"DELETE FROM filename_mappings
                   WHERE platform_fs_slug = ?1 AND rom_id NOT IN (SELECT id FROM games)"#,
            )?;
            let mut pruned = 0;
            for slug in platform_fs_slugs {
                pruned += stmt.execute(params![slug])?;
            }
            Ok(pruned)
        })?;
        if pruned > 0 {
            tracing::info!("Pruned {} stale filename mappings", pruned);
        }
        Ok(pruned)
    }

    pub fn record_failed_lookup(
        &self,
        platform_fs_slug: &str,
        local_filename_no_ext: &str,
    ) -> Result<(), CacheError> {
        self.write(
            "record",
            Entity::FailedLookup,
            format!("{platform_fs_slug}/{local_filename_no_ext}"),
            |tx| {
                tx.execute(
                    r#"INSERT INTO failed_lookups (platform_fs_slug, local_filename_no_ext, last_attempt, attempts)
                       VALUES (?1, ?2, ?3, 1)
                       ON CONFLICT (platform_fs_slug, local_filename_no_ext) DO UPDATE SET
                           last_attempt = excluded.last_attempt,
                           attempts = attempts + 1"#,
                    params![platform_fs_slug, local_filename_no_ext, Utc::now()],
                )?;
                Ok(())
            },
        )
    }

    pub fn get_failed_lookup(
        &self,
        platform_fs_slug: &str,
        local_filename_no_ext: &str,
    ) -> Result<Option<FailedLookup>, CacheError> {
        self.read(
            "get",
            Entity::FailedLookup,
            format!("{platform_fs_slug}/{local_filename_no_ext}"),
            |conn| {
                conn.query_row(
                    r#"SELECT platform_fs_slug, local_filename_no_ext, last_attempt, attempts
                       FROM failed_lookups
                       WHERE platform_fs_slug = ?1 AND local_filename_no_ext = ?2"#,
                    params![platform_fs_slug, local_filename_no_ext],
                    |row| {
                        Ok(FailedLookup {
                            platform_fs_slug: row.get(0)?,
                            local_filename_no_ext: row.get(1)?,
                            last_attempt: row.get(2)?,
                            attempts: row.get(3)?,
                        })
                    },
                )
                .optional()
            },
        )
    }

    /// Whether a hash lookup for this file is due again
    pub fn should_retry_lookup(
        &self,
        platform_fs_slug: &str,
        local_filename_no_ext: &str,
        window: Duration,
    ) -> Result<bool, CacheError> {
        Ok(match self.get_failed_lookup(platform_fs_slug, local_filename_no_ext)? {
            Some(failed) => Utc::now() - failed.last_attempt >= window,
            None => true,
        })
    }
}
