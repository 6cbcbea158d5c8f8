//! Platform rows

use crate::store::CacheStore;
use crate::{CacheError, Entity};
use chrono::Utc;
use grout_romm::Platform;
use rusqlite::{OptionalExtension, Row, Transaction, params};
use std::collections::{HashMap, HashSet};

const SELECT_PLATFORM: &str = "SELECT id, slug, fs_slug, name, api_name, custom_name, rom_count, has_bios, raw, updated_at FROM platforms";

impl CacheStore {
    /// Replace the platform table with `platforms`
    pub fn save_platforms(&self, platforms: &[Platform]) -> Result<usize, CacheError> {
        let count = self.write("save", Entity::Platform, "*", |tx| {
            let keep: HashSet<i64> = platforms.iter().map(|p| p.id).collect();
            let existing: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT id FROM platforms")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            for id in existing.into_iter().filter(|id| !keep.contains(id)) {
                tx.execute("DELETE FROM platforms WHERE id = ?1", params![id])?;
            }

            upsert_platforms(tx, platforms)?;
            disambiguate_names(tx)?;
            Ok(platforms.len())
        })?;

        tracing::debug!("Saved {} platforms", count);
        Ok(count)
    }

    /// Upsert a delta of changed platforms, keeping the rest
    pub fn merge_platforms(&self, platforms: &[Platform]) -> Result<usize, CacheError> {
        if platforms.is_empty() {
            return Ok(0);
        }
        self.write("merge", Entity::Platform, "*", |tx| {
            upsert_platforms(tx, platforms)?;
            disambiguate_names(tx)?;
            Ok(platforms.len())
        })
    }

    /// All platforms, ordered by display name
    pub fn get_platforms(&self) -> Result<Vec<Platform>, CacheError> {
        self.read("get", Entity::Platform, "*", |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_PLATFORM} ORDER BY name COLLATE NOCASE"))?;
            stmt.query_map([], row_to_platform)?.collect()
        })
    }

    /// A single platform; [`CacheError::Miss`] when absent
    pub fn get_platform(&self, id: i64) -> Result<Platform, CacheError> {
        self.read("get", Entity::Platform, id, |conn| {
            conn.query_row(
                &format!("{SELECT_PLATFORM} WHERE id = ?1"),
                params![id],
                row_to_platform,
            )
            .optional()
        })?
        .ok_or_else(|| CacheError::Miss {
            entity: Entity::Platform,
            key: id.to_string(),
        })
    }

    pub fn get_platform_by_fs_slug(&self, fs_slug: &str) -> Result<Option<Platform>, CacheError> {
        self.read("get", Entity::Platform, fs_slug, |conn| {
            conn.query_row(
                &format!("{SELECT_PLATFORM} WHERE fs_slug = ?1 LIMIT 1"),
                params![fs_slug],
                row_to_platform,
            )
            .optional()
        })
    }

    pub fn platform_count(&self) -> Result<i64, CacheError> {
        self.read("count", Entity::Platform, "*", |conn| {
            conn.query_row("SELECT COUNT(*) FROM platforms", [], |row| row.get(0))
        })
    }
}

fn upsert_platforms(tx: &Transaction<'_>, platforms: &[Platform]) -> rusqlite::Result<()> {
    let now = Utc::now();
    let mut stmt = tx.prepare(
        r#"INSERT OR REPLACE INTO platforms
           (id, slug, fs_slug, name, api_name, custom_name, rom_count, has_bios, raw, updated_at, cached_at)
           VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6,
                   COALESCE((SELECT has_bios FROM bios_availability WHERE platform_id = ?1), 0),
                   ?7, ?8, ?9)"#,
    )?;

    for platform in platforms {
        let api_name = if platform.api_name.is_empty() {
            &platform.name
        } else {
            &platform.api_name
        };
        let raw = if platform.raw.is_empty() {
            serde_json::to_string(platform).unwrap_or_default()
        } else {
            platform.raw.clone()
        };

        stmt.execute(params![
            platform.id,
            platform.slug,
            platform.fs_slug,
            api_name,
            platform.custom_name,
            platform.rom_count,
            raw,
            platform.updated_at,
            now,
        ])?;
    }
    Ok(())
}

/// Append `(fs_slug)` to every display name shared by more than one platform
fn disambiguate_names(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    let rows: Vec<(i64, String, String, String)> = {
        let mut stmt = tx.prepare("SELECT id, api_name, custom_name, fs_slug FROM platforms")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<Result<_, _>>()?
    };

    let display = |api_name: &str, custom_name: &str| -> String {
        if custom_name.trim().is_empty() {
            api_name.to_string()
        } else {
            custom_name.to_string()
        }
    };

    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, api_name, custom_name, _) in &rows {
        *counts.entry(display(api_name, custom_name)).or_default() += 1;
    }

    let mut stmt = tx.prepare("UPDATE platforms SET name = ?1 WHERE id = ?2")?;
    for (id, api_name, custom_name, fs_slug) in &rows {
        let base = display(api_name, custom_name);
        let name = if counts.get(&base).copied().unwrap_or(0) > 1 {
            format!("{} ({})", base, fs_slug)
        } else {
            base
        };
        stmt.execute(params![name, id])?;
    }
    Ok(())
}

fn row_to_platform(row: &Row<'_>) -> rusqlite::Result<Platform> {
    let raw: String = row.get(8)?;
    let mut platform = Platform::from_raw(&raw).unwrap_or_default();

    platform.id = row.get(0)?;
    platform.slug = row.get(1)?;
    platform.fs_slug = row.get(2)?;
    platform.name = row.get(3)?;
    platform.api_name = row.get(4)?;
    platform.custom_name = row.get(5)?;
    platform.rom_count = row.get(6)?;
    platform.has_bios = row.get(7)?;
    platform.raw = raw;
    platform.updated_at = row.get(9)?;
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn platform(id: i64, fs_slug: &str, name: &str) -> Platform {
        Platform {
            id,
            slug: fs_slug.to_string(),
            fs_slug: fs_slug.to_string(),
            name: name.to_string(),
            rom_count: 10,
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_and_get_platforms() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platforms(&[platform(1, "snes", "Super Nintendo"), platform(2, "gb", "Game Boy")])
            .unwrap();

        let platforms = store.get_platforms().unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[0].name, "Game Boy");

        let snes = store.get_platform(1).unwrap();
        assert_eq!(snes.fs_slug, "snes");
        assert_eq!(snes.api_name, "Super Nintendo");
        assert_eq!(snes.updated_at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_save_replaces_removed_platforms() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platforms(&[platform(1, "snes", "SNES"), platform(2, "gb", "GB")])
            .unwrap();
        store.save_platforms(&[platform(2, "gb", "GB")]).unwrap();

        assert!(store.get_platform(1).unwrap_err().is_miss());
        assert_eq!(store.platform_count().unwrap(), 1);
    }

    #[test]
    fn test_merge_keeps_other_platforms() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platforms(&[platform(1, "snes", "SNES"), platform(2, "gb", "GB")])
            .unwrap();
        store.merge_platforms(&[platform(2, "gb", "Game Boy")]).unwrap();

        assert_eq!(store.platform_count().unwrap(), 2);
        assert_eq!(store.get_platform(2).unwrap().name, "Game Boy");
    }

    #[test]
    fn test_duplicate_names_are_disambiguated() {
        let store = CacheStore::in_memory().unwrap();
        let mut custom = platform(3, "sfc", "Super Famicom");
        custom.custom_name = "Nintendo".into();
        store
            .save_platforms(&[
                platform(1, "snes", "Nintendo"),
                platform(2, "nes", "Nintendo"),
                custom,
                platform(4, "gb", "Game Boy"),
            ])
            .unwrap();

        let snes = store.get_platform(1).unwrap();
        assert_eq!(snes.name, "Nintendo (snes)");
        assert_eq!(snes.api_name, "Nintendo");
        assert_eq!(store.get_platform(3).unwrap().name, "Nintendo (sfc)");
        assert_eq!(store.get_platform(3).unwrap().api_name, "Super Famicom");
        assert_eq!(store.get_platform(4).unwrap().name, "Game Boy");

        // idempotent across refreshes
        store.save_platforms(&[platform(1, "snes", "Nintendo"), platform(2, "nes", "Nintendo")]).unwrap();
        assert_eq!(store.get_platform(1).unwrap().name, "Nintendo (snes)");
    }

    #[test]
    fn test_raw_payload_is_retained() {
        let store = CacheStore::in_memory().unwrap();
        let raw = r#"{"id":7,"slug":"psx","fs_slug":"psx","name":"PlayStation","rom_count":3,"firmware":[{"id":1}],"updated_at":"2024-05-01T00:00:00Z"}"#;
        let p = Platform::from_raw(raw).unwrap();
        store.save_platforms(&[p]).unwrap();

        let cached = store.get_platform_by_fs_slug("psx").unwrap().unwrap();
        assert_eq!(cached.raw, raw);
        assert_eq!(
            cached.updated_at,
            DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc)
        );
    }
}
