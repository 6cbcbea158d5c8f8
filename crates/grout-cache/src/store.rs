//! Database handle, lifecycle and key-value metadata

use crate::schema::{self, SCHEMA_VERSION, TABLES};
use crate::{CacheError, Entity, keys};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Directories left behind by older cache layouts
const LEGACY_DIRS: &[&str] = &["games", "platforms", "collections", "roms"];

/// Where and how to open the cache
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache_dir: PathBuf,
    pub busy_timeout: Duration,
}

impl CacheOptions {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::new(grout_config::paths::cache_dir())
    }
}

/// Read outcome counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub last_access: Option<DateTime<Utc>>,
}

enum Outcome {
    Hit,
    Miss,
    Error,
}

/// Whether a read found anything
pub(crate) trait Lookup {
    fn found(&self) -> bool;
}

impl<T> Lookup for Vec<T> {
    fn found(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Lookup for Option<T> {
    fn found(&self) -> bool {
        self.is_some()
    }
}

impl Lookup for i64 {
    fn found(&self) -> bool {
        *self > 0
    }
}

impl Lookup for bool {
    fn found(&self) -> bool {
        *self
    }
}

/// The metadata cache.
///
/// One connection, serialized behind a mutex; concurrent callers queue. The
/// connection slot is `None` once the store has been closed.
pub struct CacheStore {
    conn: Mutex<Option<Connection>>,
    cache_dir: PathBuf,
    db_path: PathBuf,
    stats: Mutex<CacheStats>,
    bulk_load: AtomicBool,
}

impl CacheStore {
    /// Open (creating if needed) the cache for `host_identity`.
    ///
    /// A cache written for a different host is cleared before use.
    pub fn initialize(host_identity: &str, options: CacheOptions) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&options.cache_dir)?;
        sweep_legacy_dirs(&options.cache_dir);

        let db_path = options.cache_dir.join(grout_config::paths::DATABASE_FILE_NAME);
        let conn = Connection::open(&db_path)
            .map_err(|e| CacheError::op("open", Entity::Database, db_path.display(), e))?;
        configure(&conn, options.busy_timeout)
            .map_err(|e| CacheError::op("configure", Entity::Database, db_path.display(), e))?;
        schema::migrate(&conn)
            .map_err(|e| CacheError::op("migrate", Entity::Database, db_path.display(), e))?;

        let store = Self {
            conn: Mutex::new(Some(conn)),
            cache_dir: options.cache_dir,
            db_path,
            stats: Mutex::new(CacheStats::default()),
            bulk_load: AtomicBool::new(false),
        };

        store.check_schema_version()?;
        store.check_host_identity(host_identity)?;

        tracing::info!("Cache opened at {}", store.db_path.display());
        Ok(store)
    }

    /// In-memory cache for tests
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CacheError::op("open", Entity::Database, ":memory:", e))?;
        schema::migrate(&conn)
            .map_err(|e| CacheError::op("migrate", Entity::Database, ":memory:", e))?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            cache_dir: PathBuf::new(),
            db_path: PathBuf::from(":memory:"),
            stats: Mutex::new(CacheStats::default()),
            bulk_load: AtomicBool::new(false),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn check_schema_version(&self) -> Result<(), CacheError> {
        let stored = self
            .get_metadata(keys::SCHEMA_VERSION)?
            .and_then(|v| v.parse::<i64>().ok());

        match stored {
            Some(version) if version > SCHEMA_VERSION => {
                tracing::warn!(
                    "Cache schema version {} is newer than supported version {}",
                    version,
                    SCHEMA_VERSION
                );
                Ok(())
            }
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            _ => self.set_metadata(keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string()),
        }
    }

    fn check_host_identity(&self, host_identity: &str) -> Result<(), CacheError> {
        let stored = self.get_metadata(keys::HOST_IDENTITY)?;

        if let Some(previous) = stored.as_deref() {
            if previous != host_identity {
                tracing::info!("Cache belongs to a different host, clearing");
                self.clear()?;
                self.set_metadata(keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
            }
        }

        if stored.as_deref() != Some(host_identity) {
            self.set_metadata(keys::HOST_IDENTITY, host_identity)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: Outcome) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Outcome::Hit => stats.hits += 1,
            Outcome::Miss => stats.misses += 1,
            Outcome::Error => stats.errors += 1,
        }
        stats.last_access = Some(Utc::now());
    }

    /// Snapshot of the read counters
    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a read, classifying its outcome for the statistics
    pub(crate) fn read<T, F>(
        &self,
        op: &'static str,
        entity: Entity,
        key: impl std::fmt::Display,
        f: F,
    ) -> Result<T, CacheError>
    where
        T: Lookup,
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.lock();
        let Some(conn) = guard.as_ref() else {
            self.record(Outcome::Error);
            return Err(CacheError::Closed);
        };

        match f(conn) {
            Ok(value) => {
                self.record(if value.found() {
                    Outcome::Hit
                } else {
                    Outcome::Miss
                });
                Ok(value)
            }
            Err(e) => {
                self.record(Outcome::Error);
                Err(CacheError::op(op, entity, key, e))
            }
        }
    }

    /// Run a write inside its own transaction
    pub(crate) fn write<T, F>(
        &self,
        op: &'static str,
        entity: Entity,
        key: impl std::fmt::Display,
        f: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(CacheError::Closed)?;

        let run = || -> rusqlite::Result<T> {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        };
        run().map_err(|e| CacheError::op(op, entity, key, e))
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), CacheError> {
        validate_key(key)?;
        self.write("set", Entity::Metadata, key, |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO cache_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, Utc::now()],
            )?;
            Ok(())
        })
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, CacheError> {
        validate_key(key)?;
        self.read("get", Entity::Metadata, key, |conn| {
            conn.query_row(
                "SELECT value FROM cache_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Timestamp stored under `key`, if any
    pub fn get_last_refresh_time(&self, key: &str) -> Result<Option<DateTime<Utc>>, CacheError> {
        Ok(self
            .get_metadata(key)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Store the current time under `key` and return it
    pub fn record_refresh_time(&self, key: &str) -> Result<DateTime<Utc>, CacheError> {
        let now = Utc::now();
        self.record_refresh_time_at(key, now)?;
        Ok(now)
    }

    pub fn record_refresh_time_at(&self, key: &str, at: DateTime<Utc>) -> Result<(), CacheError> {
        self.set_metadata(key, &at.to_rfc3339())
    }

    /// Delete every row
    pub fn clear(&self) -> Result<(), CacheError> {
        self.write("clear", Entity::Database, "*", |tx| {
            for table in TABLES {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            Ok(())
        })?;
        tracing::info!("Cache cleared");
        Ok(())
    }

    /// Delete all games, their collection edges and the games checkpoint
    pub fn clear_games(&self) -> Result<(), CacheError> {
        self.write("clear", Entity::Game, "*", |tx| {
            tx.execute("DELETE FROM game_collections", [])?;
            tx.execute("DELETE FROM games", [])?;
            tx.execute("DELETE FROM platform_sync_status", [])?;
            tx.execute(
                "DELETE FROM cache_metadata WHERE key = ?1",
                params![keys::GAMES_REFRESHED_AT],
            )?;
            Ok(())
        })
    }

    /// Delete all collections, their edges and the collections checkpoint
    pub fn clear_collections(&self) -> Result<(), CacheError> {
        self.write("clear", Entity::Collection, "*", |tx| {
            tx.execute("DELETE FROM game_collections", [])?;
            tx.execute("DELETE FROM collections", [])?;
            tx.execute(
                "DELETE FROM cache_metadata WHERE key = ?1",
                params![keys::COLLECTIONS_REFRESHED_AT],
            )?;
            Ok(())
        })
    }

    /// Close the database; later calls fail with [`CacheError::Closed`]
    pub fn close(&self) {
        if let Some(conn) = self.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("Failed to close cache database: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Close the database and remove the whole cache folder, artwork included
    pub fn delete_cache_folder(&self) -> Result<(), CacheError> {
        self.close();
        if self.cache_dir.as_os_str().is_empty() || !self.cache_dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&self.cache_dir)?;
        tracing::info!("Deleted cache folder {}", self.cache_dir.display());
        Ok(())
    }

    /// Trade durability for speed ahead of a long import
    pub fn enable_bulk_load_mode(&self) -> Result<(), CacheError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;
        let apply = || -> rusqlite::Result<()> {
            conn.pragma_update(None, "synchronous", "OFF")?;
            conn.pragma_update_and_check(None, "journal_mode", "OFF", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
            conn.pragma_update(None, "temp_store", "MEMORY")?;
            conn.pragma_update(None, "cache_size", -64000)?;
            Ok(())
        };
        apply().map_err(|e| CacheError::op("enable_bulk_load", Entity::Database, "pragma", e))?;
        self.bulk_load.store(true, Ordering::SeqCst);
        tracing::debug!("Bulk load mode enabled");
        Ok(())
    }

    /// Restore write-ahead journaling and normal durability
    pub fn disable_bulk_load_mode(&self) -> Result<(), CacheError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;
        let apply = || -> rusqlite::Result<()> {
            conn.pragma_update(None, "locking_mode", "NORMAL")?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "temp_store", "DEFAULT")?;
            conn.pragma_update(None, "cache_size", -2000)?;
            Ok(())
        };
        apply().map_err(|e| CacheError::op("disable_bulk_load", Entity::Database, "pragma", e))?;
        self.bulk_load.store(false, Ordering::SeqCst);
        tracing::debug!("Bulk load mode disabled");
        Ok(())
    }

    pub fn is_bulk_load_mode(&self) -> bool {
        self.bulk_load.load(Ordering::SeqCst)
    }

    /// Bulk load mode for the lifetime of the returned guard
    pub fn bulk_load(&self) -> Result<BulkLoadGuard<'_>, CacheError> {
        self.enable_bulk_load_mode()?;
        Ok(BulkLoadGuard { store: self })
    }
}

/// Restores normal durability when dropped
pub struct BulkLoadGuard<'a> {
    store: &'a CacheStore,
}

impl Drop for BulkLoadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.disable_bulk_load_mode() {
            tracing::warn!("Failed to leave bulk load mode: {}", e);
        }
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn sweep_legacy_dirs(cache_dir: &Path) {
    for name in LEGACY_DIRS {
        let dir = cache_dir.join(name);
        if !dir.is_dir() {
            continue;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::info!("Removed legacy cache directory {}", dir.display()),
            Err(e) => tracing::warn!("Failed to remove legacy cache directory {}: {}", dir.display(), e),
        }
    }
}
