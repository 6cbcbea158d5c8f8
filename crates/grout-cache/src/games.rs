//! Game (ROM) rows

use crate::store::CacheStore;
use crate::{CacheError, Entity};
use chrono::{DateTime, Utc};
use grout_romm::{Rom, RomHash};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, Transaction, params};

const SELECT_GAME: &str = "SELECT g.id, g.platform_id, g.platform_fs_slug, g.name, g.fs_name, g.fs_name_no_ext, g.crc_hash, g.md5_hash, g.sha1_hash, g.raw, g.updated_at FROM games g";

impl CacheStore {
    /// Replace every game of `platform_id` with `games`
    pub fn save_platform_games(&self, platform_id: i64, games: &[Rom]) -> Result<usize, CacheError> {
        self.write("save", Entity::Game, format!("platform={platform_id}"), |tx| {
            tx.execute("DELETE FROM games WHERE platform_id = ?1", params![platform_id])?;
            upsert_games(tx, games)?;
            Ok(games.len())
        })
    }

    /// Upsert changed games, keeping the rest
    pub fn merge_games(&self, games: &[Rom]) -> Result<usize, CacheError> {
        if games.is_empty() {
            return Ok(0);
        }
        self.write("merge", Entity::Game, "*", |tx| {
            upsert_games(tx, games)?;
            Ok(games.len())
        })
    }

    pub fn get_platform_games(&self, platform_id: i64) -> Result<Vec<Rom>, CacheError> {
        self.read("get", Entity::Game, format!("platform={platform_id}"), |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_GAME} WHERE g.platform_id = ?1 ORDER BY g.name COLLATE NOCASE"
            ))?;
            stmt.query_map(params![platform_id], row_to_game)?.collect()
        })
    }

    pub fn get_game(&self, id: i64) -> Result<Option<Rom>, CacheError> {
        self.read("get", Entity::Game, id, |conn| {
            conn.query_row(&format!("{SELECT_GAME} WHERE g.id = ?1"), params![id], row_to_game)
                .optional()
        })
    }

    /// Game whose server file name (without extension) matches a local file
    pub fn find_game_by_file(
        &self,
        platform_fs_slug: &str,
        fs_name_no_ext: &str,
    ) -> Result<Option<Rom>, CacheError> {
        self.read(
            "find",
            Entity::Game,
            format!("{platform_fs_slug}/{fs_name_no_ext}"),
            |conn| {
                conn.query_row(
                    &format!(
                        "{SELECT_GAME} WHERE g.platform_fs_slug = ?1 AND g.fs_name_no_ext = ?2 LIMIT 1"
                    ),
                    params![platform_fs_slug, fs_name_no_ext],
                    row_to_game,
                )
                .optional()
            },
        )
    }

    /// Game carrying the given hash
    pub fn find_game_by_hash(&self, hash: &RomHash) -> Result<Option<Rom>, CacheError> {
        let (column, value) = hash.to_pair();
        self.read("find", Entity::Game, format!("{column}={value}"), |conn| {
            conn.query_row(
                &format!("{SELECT_GAME} WHERE g.{column} = ?1 COLLATE NOCASE LIMIT 1"),
                params![value],
                row_to_game,
            )
            .optional()
        })
    }

    /// Games whose name contains `query`
    pub fn search_games(&self, query: &str) -> Result<Vec<Rom>, CacheError> {
        self.read("search", Entity::Game, query, |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_GAME} WHERE g.name LIKE ?1 ORDER BY g.name COLLATE NOCASE"
            ))?;
            stmt.query_map(params![format!("%{}%", query)], row_to_game)?
                .collect()
        })
    }

    pub fn game_count(&self) -> Result<i64, CacheError> {
        self.read("count", Entity::Game, "*", |conn| {
            conn.query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))
        })
    }

    pub fn platform_game_count(&self, platform_id: i64) -> Result<i64, CacheError> {
        self.read("count", Entity::Game, format!("platform={platform_id}"), |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM games WHERE platform_id = ?1",
                params![platform_id],
                |row| row.get(0),
            )
        })
    }

    /// Newest server `updated_at` among the platform's cached games
    pub fn latest_game_update(&self, platform_id: i64) -> Result<Option<DateTime<Utc>>, CacheError> {
        self.read("latest", Entity::Game, format!("platform={platform_id}"), |conn| {
            conn.query_row(
                "SELECT updated_at FROM games WHERE platform_id = ?1 ORDER BY updated_at DESC LIMIT 1",
                params![platform_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// When the game row was last written locally
    pub fn game_cached_at(&self, id: i64) -> Result<Option<DateTime<Utc>>, CacheError> {
        self.read("cached_at", Entity::Game, id, |conn| {
            conn.query_row("SELECT cached_at FROM games WHERE id = ?1", params![id], |row| row.get(0))
                .optional()
        })
    }
}

fn upsert_games(tx: &Transaction<'_>, games: &[Rom]) -> rusqlite::Result<()> {
    let now = Utc::now();
    let mut stmt = tx.prepare(
        r#"INSERT OR REPLACE INTO games
           (id, platform_id, platform_fs_slug, name, fs_name, fs_name_no_ext,
            crc_hash, md5_hash, sha1_hash, raw, updated_at, cached_at)
           VALUES (?1, ?2,
                   COALESCE(NULLIF(?3, ''), (SELECT fs_slug FROM platforms WHERE id = ?2), ''),
                   ?4, ?5, ?6, NULLIF(?7, ''), NULLIF(?8, ''), NULLIF(?9, ''), ?10, ?11, ?12)"#,
    )?;

    for game in games {
        stmt.execute(params![
            game.id,
            game.platform_id,
            game.platform_fs_slug,
            game.name,
            game.fs_name,
            game.fs_name_no_ext,
            game.crc_hash,
            game.md5_hash,
            game.sha1_hash,
            game.raw_or_encoded(),
            game.updated_at,
            now,
        ])?;
    }
    Ok(())
}

pub(crate) fn row_to_game(row: &Row<'_>) -> rusqlite::Result<Rom> {
    let raw: String = row.get(9)?;
    let mut game = Rom::from_raw(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

    game.id = row.get(0)?;
    game.platform_id = row.get(1)?;
    game.platform_fs_slug = row.get(2)?;
    game.name = row.get(3)?;
    game.fs_name = row.get(4)?;
    game.fs_name_no_ext = row.get(5)?;
    game.crc_hash = row.get(6)?;
    game.md5_hash = row.get(7)?;
    game.sha1_hash = row.get(8)?;
    game.updated_at = row.get(10)?;
    Ok(game)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use grout_romm::Platform;

    fn game(id: i64, platform_id: i64, name: &str) -> Rom {
        Rom {
            id,
            platform_id,
            platform_fs_slug: "snes".into(),
            name: name.to_string(),
            fs_name: format!("{name}.sfc"),
            fs_name_no_ext: name.to_string(),
            fs_extension: "sfc".into(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, id as u32 % 28 + 1, 0, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_platform_games_replaces() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platform_games(1, &[game(1, 1, "Zelda"), game(2, 1, "Mario")])
            .unwrap();
        store.save_platform_games(2, &[game(3, 2, "Tetris")]).unwrap();
        store.save_platform_games(1, &[game(2, 1, "Mario")]).unwrap();

        let games = store.get_platform_games(1).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].name, "Mario");
        assert_eq!(store.game_count().unwrap(), 2);
    }

    #[test]
    fn test_merge_keeps_other_games() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platform_games(1, &[game(1, 1, "Zelda"), game(2, 1, "Mario")])
            .unwrap();
        store.merge_games(&[game(2, 1, "Super Mario World")]).unwrap();

        assert_eq!(store.platform_game_count(1).unwrap(), 2);
        assert_eq!(store.get_game(2).unwrap().unwrap().name, "Super Mario World");
    }

    #[test]
    fn test_resave_preserves_updated_at_and_advances_cached_at() {
        let store = CacheStore::in_memory().unwrap();
        let rom = game(5, 1, "Zelda");
        store.save_platform_games(1, std::slice::from_ref(&rom)).unwrap();
        let first = store.game_cached_at(5).unwrap().unwrap();

        store.save_platform_games(1, std::slice::from_ref(&rom)).unwrap();
        let second = store.game_cached_at(5).unwrap().unwrap();

        assert!(second >= first);
        assert_eq!(store.get_game(5).unwrap().unwrap().updated_at, rom.updated_at);
        assert_eq!(store.latest_game_update(1).unwrap(), Some(rom.updated_at));
    }

    #[test]
    fn test_find_by_file_and_hash() {
        let store = CacheStore::in_memory().unwrap();
        let mut rom = game(9, 1, "Chrono Trigger (USA)");
        rom.crc_hash = Some("2D206BF7".into());
        rom.sha1_hash = Some("".into());
        store.save_platform_games(1, &[rom]).unwrap();

        let by_file = store.find_game_by_file("snes", "Chrono Trigger (USA)").unwrap();
        assert_eq!(by_file.map(|g| g.id), Some(9));

        let by_crc = store.find_game_by_hash(&RomHash::Crc("2d206bf7".into())).unwrap();
        assert_eq!(by_crc.map(|g| g.id), Some(9));

        // empty hashes are stored as NULL
        let cached = store.get_game(9).unwrap().unwrap();
        assert_eq!(cached.sha1_hash, None);
        assert!(store.find_game_by_hash(&RomHash::Sha1("".into())).unwrap().is_none());
    }

    #[test]
    fn test_missing_fs_slug_taken_from_platform() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platforms(&[Platform {
                id: 4,
                slug: "gba".into(),
                fs_slug: "gba".into(),
                name: "Game Boy Advance".into(),
                ..Default::default()
            }])
            .unwrap();

        let mut rom = game(1, 4, "Metroid");
        rom.platform_fs_slug = String::new();
        store.save_platform_games(4, &[rom]).unwrap();

        assert_eq!(store.get_game(1).unwrap().unwrap().platform_fs_slug, "gba");
    }

    #[test]
    fn test_multi_file_rom_keeps_files() {
        let store = CacheStore::in_memory().unwrap();
        let raw = r#"{"id":20,"platform_id":2,"platform_fs_slug":"psx","name":"FF7","fs_name":"FF7","fs_name_no_ext":"FF7","files":[{"id":1,"file_name":"disc1.chd"},{"id":2,"file_name":"disc2.chd"}],"updated_at":"2024-02-02T00:00:00Z"}"#;
        store
            .save_platform_games(2, &[Rom::from_raw(raw).unwrap()])
            .unwrap();

        let cached = store.get_game(20).unwrap().unwrap();
        assert!(cached.is_multi_file());
        assert_eq!(cached.files[1].file_name, "disc2.chd");
    }

    #[test]
    fn test_search_games() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platform_games(1, &[game(1, 1, "Super Metroid"), game(2, 1, "Zelda")])
            .unwrap();

        let found = store.search_games("metroid").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);
    }
}
