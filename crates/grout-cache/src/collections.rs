//! Collection rows and game↔collection edges

use crate::games::row_to_game;
use crate::store::CacheStore;
use crate::{CacheError, Entity};
use chrono::{DateTime, Utc};
use grout_romm::{Collection, CollectionId, CollectionKind, Rom};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::collections::HashSet;

const SELECT_COLLECTION: &str =
    "SELECT id, romm_id, virtual_id, type, name, rom_count, raw, updated_at FROM collections";

impl CacheStore {
    /// Replace the collection table with `collections`.
    ///
    /// Rows no longer present are dropped together with their edges.
    pub fn save_collections(&self, collections: &[Collection]) -> Result<usize, CacheError> {
        let count = self.write("save", Entity::Collection, "*", |tx| {
            let mut keep = HashSet::new();
            for collection in collections {
                keep.insert(upsert_collection(tx, collection)?);
            }

            let existing: Vec<i64> = {
                let mut stmt = tx.prepare("SELECT id FROM collections")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            for id in existing.into_iter().filter(|id| !keep.contains(id)) {
                tx.execute("DELETE FROM game_collections WHERE collection_id = ?1", params![id])?;
                tx.execute("DELETE FROM collections WHERE id = ?1", params![id])?;
            }
            Ok(collections.len())
        })?;

        tracing::debug!("Saved {} collections", count);
        Ok(count)
    }

    /// Upsert collections and their edges, keeping every other collection
    pub fn merge_collections(&self, collections: &[Collection]) -> Result<usize, CacheError> {
        self.write("merge", Entity::Collection, "*", |tx| {
            for collection in collections {
                let row_id = upsert_collection(tx, collection)?;
                tx.execute(
                    "DELETE FROM game_collections WHERE collection_id = ?1",
                    params![row_id],
                )?;
                for rom_id in &collection.rom_ids {
                    tx.execute(
                        "INSERT OR IGNORE INTO game_collections (game_id, collection_id) VALUES (?1, ?2)",
                        params![rom_id, row_id],
                    )?;
                }
            }
            Ok(collections.len())
        })
    }

    /// Replace the edges of each collection with its `rom_ids`
    pub fn save_collection_games(&self, collections: &[Collection]) -> Result<usize, CacheError> {
        self.write("save_edges", Entity::Collection, "*", |tx| {
            let mut edges = 0;
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO game_collections (game_id, collection_id) VALUES (?1, ?2)",
            )?;

            for collection in collections {
                let Some(row_id) = collection_row_id(tx, &collection.id)? else {
                    continue;
                };
                tx.execute(
                    "DELETE FROM game_collections WHERE collection_id = ?1",
                    params![row_id],
                )?;
                for rom_id in &collection.rom_ids {
                    edges += insert.execute(params![rom_id, row_id])?;
                }
            }
            Ok(edges)
        })
    }

    pub fn get_collections(&self) -> Result<Vec<Collection>, CacheError> {
        self.read("get", Entity::Collection, "*", |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_COLLECTION} ORDER BY name COLLATE NOCASE"))?;
            stmt.query_map([], row_to_collection)?.collect()
        })
    }

    pub fn get_collections_by_type(&self, kind: CollectionKind) -> Result<Vec<Collection>, CacheError> {
        self.read("get", Entity::Collection, kind, |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLLECTION} WHERE type = ?1 ORDER BY name COLLATE NOCASE"
            ))?;
            stmt.query_map(params![kind.as_str()], row_to_collection)?
                .collect()
        })
    }

    pub fn get_collection(&self, id: &CollectionId) -> Result<Option<Collection>, CacheError> {
        self.read("get", Entity::Collection, id, |conn| {
            let Some(row_id) = collection_row_id(conn, id)? else {
                return Ok(None);
            };
            conn.query_row(
                &format!("{SELECT_COLLECTION} WHERE id = ?1"),
                params![row_id],
                row_to_collection,
            )
            .optional()
        })
    }

    /// Games linked to a collection
    pub fn get_collection_games(&self, id: &CollectionId) -> Result<Vec<Rom>, CacheError> {
        self.read("get_games", Entity::Collection, id, |conn| {
            let Some(row_id) = collection_row_id(conn, id)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT g.id, g.platform_id, g.platform_fs_slug, g.name, g.fs_name, g.fs_name_no_ext,
                        g.crc_hash, g.md5_hash, g.sha1_hash, g.raw, g.updated_at
                 FROM games g
                 JOIN game_collections gc ON gc.game_id = g.id
                 WHERE gc.collection_id = ?1
                 ORDER BY g.name COLLATE NOCASE",
            )?;
            stmt.query_map(params![row_id], row_to_game)?.collect()
        })
    }

    /// Server `updated_at` recorded for a collection
    pub fn collection_updated_at(&self, id: &CollectionId) -> Result<Option<DateTime<Utc>>, CacheError> {
        Ok(self.get_collection(id)?.and_then(|c| c.updated_at))
    }
}

/// Insert or update a collection, returning its internal row id
fn upsert_collection(tx: &Transaction<'_>, collection: &Collection) -> rusqlite::Result<i64> {
    let now = Utc::now();
    let conflict = match collection.id {
        CollectionId::Virtual(_) => "virtual_id",
        _ => "romm_id, type",
    };

    tx.query_row(
        &format!(
            r#"INSERT INTO collections (romm_id, virtual_id, type, name, rom_count, raw, updated_at, cached_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT ({conflict}) DO UPDATE SET
                   name = excluded.name,
                   rom_count = excluded.rom_count,
                   raw = excluded.raw,
                   updated_at = excluded.updated_at,
                   cached_at = excluded.cached_at
               RETURNING id"#
        ),
        params![
            collection.id.romm_id(),
            collection.id.virtual_id(),
            collection.kind().as_str(),
            collection.name,
            collection.rom_count,
            collection.raw,
            collection.updated_at,
            now,
        ],
        |row| row.get(0),
    )
}

fn collection_row_id(conn: &Connection, id: &CollectionId) -> rusqlite::Result<Option<i64>> {
    match id {
        CollectionId::Virtual(virtual_id) => conn
            .query_row(
                "SELECT id FROM collections WHERE virtual_id = ?1",
                params![virtual_id],
                |row| row.get(0),
            )
            .optional(),
        other => conn
            .query_row(
                "SELECT id FROM collections WHERE romm_id = ?1 AND type = ?2",
                params![other.romm_id(), other.kind().as_str()],
                |row| row.get(0),
            )
            .optional(),
    }
}

fn row_to_collection(row: &Row<'_>) -> rusqlite::Result<Collection> {
    let kind_str: String = row.get(3)?;
    let kind = CollectionKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("unknown type {kind_str}").into())
    })?;

    let id = match kind {
        CollectionKind::Virtual => CollectionId::Virtual(row.get(2)?),
        CollectionKind::Regular => CollectionId::Regular(row.get(1)?),
        CollectionKind::Smart => CollectionId::Smart(row.get(1)?),
    };

    let raw: String = row.get(6)?;
    let rom_ids = Collection::from_raw(kind, &raw)
        .map(|c| c.rom_ids)
        .unwrap_or_default();

    Ok(Collection {
        id,
        name: row.get(4)?,
        rom_count: row.get(5)?,
        rom_ids,
        updated_at: row.get(7)?,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn collection(kind: CollectionKind, raw: &str) -> Collection {
        Collection::from_raw(kind, raw).unwrap()
    }

    fn rom(id: i64, name: &str) -> Rom {
        Rom {
            id,
            platform_id: 1,
            platform_fs_slug: "snes".into(),
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_integer_id_across_types() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_collections(&[
                collection(CollectionKind::Regular, r#"{"id":1,"name":"Favorites"}"#),
                collection(CollectionKind::Smart, r#"{"id":1,"name":"Recently Added"}"#),
                collection(CollectionKind::Virtual, r#"{"id":"1","name":"Genre"}"#),
            ])
            .unwrap();

        assert_eq!(store.get_collections().unwrap().len(), 3);
        assert_eq!(
            store.get_collections_by_type(CollectionKind::Smart).unwrap()[0].name,
            "Recently Added"
        );
    }

    #[test]
    fn test_save_collections_is_idempotent_and_replaces() {
        let store = CacheStore::in_memory().unwrap();
        let favs = collection(CollectionKind::Regular, r#"{"id":5,"name":"Favs","rom_ids":[1]}"#);
        let rpg = collection(CollectionKind::Virtual, r#"{"id":"rpg","name":"RPG","rom_ids":[2]}"#);

        store.save_collections(&[favs.clone(), rpg.clone()]).unwrap();
        store.save_collection_games(&[favs.clone(), rpg.clone()]).unwrap();
        store.save_collections(&[favs.clone(), rpg.clone()]).unwrap();
        assert_eq!(store.get_collections().unwrap().len(), 2);

        store.save_collections(&[favs]).unwrap();
        let remaining = store.get_collections().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, CollectionId::Regular(5));
        assert!(store.get_collection_games(&rpg.id).unwrap().is_empty());
    }

    #[test]
    fn test_collection_games() {
        let store = CacheStore::in_memory().unwrap();
        store
            .save_platform_games(1, &[rom(1, "Zelda"), rom(2, "Mario"), rom(3, "Metroid")])
            .unwrap();

        let favs = collection(CollectionKind::Regular, r#"{"id":5,"name":"Favs","rom_ids":[3,1]}"#);
        store.save_collections(std::slice::from_ref(&favs)).unwrap();
        assert_eq!(store.save_collection_games(std::slice::from_ref(&favs)).unwrap(), 2);

        let games = store.get_collection_games(&favs.id).unwrap();
        let names: Vec<_> = games.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Metroid", "Zelda"]);

        let shrunk = collection(CollectionKind::Regular, r#"{"id":5,"name":"Favs","rom_ids":[2]}"#);
        store.save_collection_games(&[shrunk]).unwrap();
        let games = store.get_collection_games(&favs.id).unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].id, 2);
    }

    #[test]
    fn test_merge_collections_keeps_others() {
        let store = CacheStore::in_memory().unwrap();
        let favs = collection(CollectionKind::Regular, r#"{"id":5,"name":"Favs","rom_ids":[1]}"#);
        let rpg = collection(CollectionKind::Virtual, r#"{"id":"rpg","name":"RPG","rom_ids":[2]}"#);
        store.save_collections(&[favs, rpg]).unwrap();

        let renamed = collection(CollectionKind::Virtual, r#"{"id":"rpg","name":"Role Playing","rom_ids":[2,3]}"#);
        store.merge_collections(&[renamed]).unwrap();

        let all = store.get_collections().unwrap();
        assert_eq!(all.len(), 2);
        let rpg = store
            .get_collection(&CollectionId::Virtual("rpg".into()))
            .unwrap()
            .unwrap();
        assert_eq!(rpg.name, "Role Playing");
        assert_eq!(rpg.rom_ids, vec![2, 3]);
    }

    #[test]
    fn test_collection_updated_at() {
        let store = CacheStore::in_memory().unwrap();
        let favs = collection(
            CollectionKind::Regular,
            r#"{"id":5,"name":"Favs","updated_at":"2024-04-01T08:00:00Z"}"#,
        );
        store.save_collections(&[favs]).unwrap();

        assert_eq!(
            store.collection_updated_at(&CollectionId::Regular(5)).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(store.collection_updated_at(&CollectionId::Smart(5)).unwrap(), None);
    }
}
