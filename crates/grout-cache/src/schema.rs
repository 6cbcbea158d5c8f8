//! Table definitions
//!
//! Evolution is append-only: new tables and columns may be added, nothing
//! is renamed or dropped. Bump `SCHEMA_VERSION` with every addition.

use rusqlite::Connection;

pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Tables holding server-derived and bookkeeping rows, in delete order
pub(crate) const TABLES: &[&str] = &[
    "game_collections",
    "games",
    "collections",
    "bios_availability",
    "platforms",
    "filename_mappings",
    "failed_lookups",
    "platform_sync_status",
    "cache_metadata",
];

pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS platforms (
            id INTEGER PRIMARY KEY,
            slug TEXT NOT NULL,
            fs_slug TEXT NOT NULL,
            name TEXT NOT NULL,
            api_name TEXT NOT NULL,
            custom_name TEXT NOT NULL DEFAULT '',
            rom_count INTEGER NOT NULL DEFAULT 0,
            has_bios INTEGER NOT NULL DEFAULT 0,
            raw TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            cached_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            romm_id INTEGER,
            virtual_id TEXT,
            type TEXT NOT NULL CHECK (type IN ('regular', 'smart', 'virtual')),
            name TEXT NOT NULL,
            rom_count INTEGER NOT NULL DEFAULT 0,
            raw TEXT NOT NULL,
            updated_at TEXT,
            cached_at TEXT NOT NULL,
            UNIQUE (romm_id, type),
            UNIQUE (virtual_id),
            CHECK (
                (type = 'virtual' AND virtual_id IS NOT NULL AND romm_id IS NULL)
                OR (type != 'virtual' AND romm_id IS NOT NULL AND virtual_id IS NULL)
            )
        );

        CREATE TABLE IF NOT EXISTS games (
            id INTEGER PRIMARY KEY,
            platform_id INTEGER NOT NULL,
            platform_fs_slug TEXT NOT NULL,
            name TEXT NOT NULL,
            fs_name TEXT NOT NULL,
            fs_name_no_ext TEXT NOT NULL,
            crc_hash TEXT,
            md5_hash TEXT,
            sha1_hash TEXT,
            raw TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            cached_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS game_collections (
            game_id INTEGER NOT NULL,
            collection_id INTEGER NOT NULL,
            PRIMARY KEY (game_id, collection_id)
        );

        CREATE TABLE IF NOT EXISTS bios_availability (
            platform_id INTEGER PRIMARY KEY,
            has_bios INTEGER NOT NULL,
            checked_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS filename_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform_fs_slug TEXT NOT NULL,
            local_filename_no_ext TEXT NOT NULL,
            rom_id INTEGER NOT NULL,
            rom_name TEXT NOT NULL,
            matched_at TEXT NOT NULL,
            UNIQUE (platform_fs_slug, local_filename_no_ext)
        );

        CREATE TABLE IF NOT EXISTS failed_lookups (
            platform_fs_slug TEXT NOT NULL,
            local_filename_no_ext TEXT NOT NULL,
            last_attempt TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (platform_fs_slug, local_filename_no_ext)
        );

        CREATE TABLE IF NOT EXISTS platform_sync_status (
            platform_id INTEGER PRIMARY KEY,
            last_successful_sync TEXT,
            last_attempt TEXT NOT NULL,
            games_synced INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('pending', 'ok', 'failed'))
        );

        CREATE TABLE IF NOT EXISTS cache_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_platforms_fs_slug ON platforms(fs_slug);
        CREATE INDEX IF NOT EXISTS idx_collections_type ON collections(type);
        CREATE INDEX IF NOT EXISTS idx_games_platform ON games(platform_id);
        CREATE INDEX IF NOT EXISTS idx_games_fs_lookup ON games(platform_fs_slug, fs_name_no_ext);
        CREATE INDEX IF NOT EXISTS idx_games_crc ON games(crc_hash)
            WHERE crc_hash IS NOT NULL AND crc_hash != '';
        CREATE INDEX IF NOT EXISTS idx_games_md5 ON games(md5_hash)
            WHERE md5_hash IS NOT NULL AND md5_hash != '';
        CREATE INDEX IF NOT EXISTS idx_games_sha1 ON games(sha1_hash)
            WHERE sha1_hash IS NOT NULL AND sha1_hash != '';
        CREATE INDEX IF NOT EXISTS idx_game_collections_collection ON game_collections(collection_id);
        CREATE INDEX IF NOT EXISTS idx_filename_mappings_rom ON filename_mappings(rom_id);
    "#,
    )
}
