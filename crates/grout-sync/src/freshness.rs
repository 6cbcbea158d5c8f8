//! Session-local freshness oracle
//!
//! At startup the oracle checks the server once per mapped platform and
//! per visible collection, compares the answers with the cache, and
//! prefetches whatever is stale. Later callers ask [`FreshnessOracle::is_cache_fresh`]
//! instead of going to the network. A platform verified this way lets exactly
//! one full sync skip it, see [`FreshnessOracle::take_verified`].

use crate::{SYNC_CONCURRENCY, SYNC_PAGE_SIZE, panic_message};
use futures_util::{FutureExt, StreamExt, stream};
use grout_cache::CacheStore;
use grout_romm::{Collection, CollectionId, CollectionKind, Platform, RomQuery, RommApi, fetch_all_roms};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;

/// Unit of cached data the oracle reasons about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Platform(i64),
    Collection(CollectionId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Platform(id) => write!(f, "platform:{}", id),
            CacheKey::Collection(id) => write!(f, "collection:{}", id),
        }
    }
}

impl FromStr for CacheKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid cache key: {s}");
        match s.split_once(':').ok_or_else(invalid)? {
            ("platform", id) => id.parse().map(CacheKey::Platform).map_err(|_| invalid()),
            ("collection", rest) => {
                let (kind, id) = rest.split_once(':').ok_or_else(invalid)?;
                let id = match CollectionKind::parse(kind).ok_or_else(invalid)? {
                    CollectionKind::Regular => CollectionId::Regular(id.parse().map_err(|_| invalid())?),
                    CollectionKind::Smart => CollectionId::Smart(id.parse().map_err(|_| invalid())?),
                    CollectionKind::Virtual => CollectionId::Virtual(id.to_string()),
                };
                Ok(CacheKey::Collection(id))
            }
            _ => Err(invalid()),
        }
    }
}

type PrefetchMap = Arc<Mutex<HashMap<CacheKey, watch::Receiver<bool>>>>;

/// Signals completion of one prefetch when dropped, on every exit path
struct PrefetchGuard {
    key: CacheKey,
    done: watch::Sender<bool>,
    map: PrefetchMap,
}

impl Drop for PrefetchGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        let _ = self.done.send(true);
    }
}

pub struct FreshnessOracle {
    api: Arc<dyn RommApi>,
    store: Arc<CacheStore>,
    fresh: RwLock<HashMap<CacheKey, bool>>,
    /// Keys the startup pass found current; each is handed to a sync once
    verified: Mutex<HashSet<CacheKey>>,
    bios: RwLock<HashMap<i64, bool>>,
    prefetch: PrefetchMap,
}

impl FreshnessOracle {
    pub fn new(api: Arc<dyn RommApi>, store: Arc<CacheStore>) -> Self {
        Self {
            api,
            store,
            fresh: RwLock::new(HashMap::new()),
            verified: Mutex::new(HashSet::new()),
            bios: RwLock::new(HashMap::new()),
            prefetch: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `None` until the oracle has decided about `key` this session
    pub fn is_cache_fresh(&self, key: &CacheKey) -> Option<bool> {
        self.fresh
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn mark_cache_fresh(&self, key: CacheKey) {
        self.fresh
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, true);
    }

    pub fn mark_cache_stale(&self, key: CacheKey) {
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        self.fresh
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, false);
    }

    /// Whether the startup pass vouched for `key`; only the first caller is told so.
    ///
    /// Freshness marked by a sync does not count, so later syncs in the
    /// session still reach the server.
    pub fn take_verified(&self, key: &CacheKey) -> bool {
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    fn mark_verified(&self, key: CacheKey) {
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        self.mark_cache_fresh(key);
    }

    /// `None` when the platform has not been checked
    pub fn has_bios(&self, platform_id: i64) -> Option<bool> {
        self.bios
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&platform_id)
            .copied()
    }

    pub fn set_bios(&self, platform_id: i64, has_bios: bool) {
        self.bios
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform_id, has_bios);
    }

    pub fn is_prefetch_in_progress(&self, key: &CacheKey) -> bool {
        self.prefetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Wait for an in-flight prefetch of `key`; `false` at once if none
    pub async fn wait_for_prefetch(&self, key: &CacheKey) -> bool {
        let receiver = self
            .prefetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();

        let Some(mut receiver) = receiver else {
            return false;
        };

        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                break;
            }
        }
        true
    }

    /// Claim `key` for prefetching; `None` if someone else holds it
    fn begin_prefetch(&self, key: CacheKey) -> Option<PrefetchGuard> {
        let mut map = self.prefetch.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&key) {
            return None;
        }
        let (done, receiver) = watch::channel(false);
        map.insert(key.clone(), receiver);
        Some(PrefetchGuard {
            key,
            done,
            map: Arc::clone(&self.prefetch),
        })
    }

    /// Startup pass: check platforms, BIOS and collections concurrently
    pub async fn run_startup(&self, platforms: &[Platform], kinds: &[CollectionKind]) {
        tracing::info!(
            "Checking cache freshness for {} platforms and {} collection types",
            platforms.len(),
            kinds.len()
        );

        tokio::join!(
            guarded_each(platforms, "platform check", |p| self.check_platform(p)),
            guarded_each(platforms, "bios check", |p| self.check_bios(p)),
            guarded_each(kinds, "collection check", |k| self.check_collections(*k)),
        );

        tracing::info!("Cache freshness check complete");
    }

    async fn check_platform(&self, platform: &Platform) {
        let key = CacheKey::Platform(platform.id);
        let query = RomQuery::for_platform(platform.id).page(0, 1).newest_first();

        let remote = match self.api.roms(&query).await {
            Ok(page) => page.items.first().map(|r| r.updated_at),
            Err(e) => {
                tracing::warn!("Freshness check failed for {}: {}", key, e);
                return;
            }
        };
        let local = match self.store.latest_game_update(platform.id) {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!("Failed to read cached games for {}: {}", key, e);
                None
            }
        };

        let stale = match (local, remote) {
            (None, None) => false,
            (Some(_), None) | (None, Some(_)) => true,
            (Some(local), Some(remote)) => local < remote,
        };

        if stale {
            self.mark_cache_stale(key.clone());
            self.prefetch_platform(platform.id, key).await;
        } else {
            self.mark_verified(key);
        }
    }

    async fn prefetch_platform(&self, platform_id: i64, key: CacheKey) {
        let Some(_guard) = self.begin_prefetch(key.clone()) else {
            return;
        };

        let query = RomQuery::for_platform(platform_id);
        let result = match fetch_all_roms(self.api.as_ref(), &query, SYNC_PAGE_SIZE, |_| {}).await {
            Ok(games) => self
                .store
                .save_platform_games(platform_id, &games)
                .and_then(|count| self.store.record_platform_sync_success(platform_id, count as i64))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                tracing::debug!("Prefetched {}", key);
                self.mark_verified(key);
            }
            Err(e) => tracing::warn!("Prefetch of {} failed: {}", key, e),
        }
    }

    async fn check_bios(&self, platform: &Platform) {
        match self.api.firmware(platform.id).await {
            Ok(firmware) => self.set_bios(platform.id, !firmware.is_empty()),
            Err(e) => tracing::warn!("BIOS check failed for platform {}: {}", platform.id, e),
        }
    }

    async fn check_collections(&self, kind: CollectionKind) {
        let collections = match self.api.collections(kind, None).await {
            Ok(collections) => collections,
            Err(e) => {
                tracing::warn!("Failed to list {} collections: {}", kind, e);
                return;
            }
        };

        for collection in collections {
            let key = CacheKey::Collection(collection.id.clone());
            let cached = match self.store.collection_updated_at(&collection.id) {
                Ok(cached) => cached,
                Err(e) => {
                    tracing::warn!("Failed to read cached {}: {}", key, e);
                    None
                }
            };

            let stale = match (cached, collection.updated_at) {
                (Some(cached), Some(remote)) => cached < remote,
                (None, _) => true,
                (Some(_), None) => false,
            };

            if stale {
                self.mark_cache_stale(key.clone());
                self.prefetch_collection(collection, key).await;
            } else {
                self.mark_cache_fresh(key);
            }
        }
    }

    async fn prefetch_collection(&self, mut collection: Collection, key: CacheKey) {
        let Some(_guard) = self.begin_prefetch(key.clone()) else {
            return;
        };

        let mut query = RomQuery::default();
        match &collection.id {
            CollectionId::Regular(id) => query.collection_id = Some(*id),
            CollectionId::Smart(id) => query.smart_collection_id = Some(*id),
            CollectionId::Virtual(id) => query.virtual_collection_id = Some(id.clone()),
        }

        let games = match fetch_all_roms(self.api.as_ref(), &query, SYNC_PAGE_SIZE, |_| {}).await {
            Ok(games) => games,
            Err(e) => {
                tracing::warn!("Prefetch of {} failed: {}", key, e);
                return;
            }
        };

        if collection.rom_ids.is_empty() {
            collection.rom_ids = games.iter().map(|g| g.id).collect();
        }

        let saved = self
            .store
            .merge_games(&games)
            .and_then(|_| self.store.merge_collections(std::slice::from_ref(&collection)));
        match saved {
            Ok(_) => {
                tracing::debug!("Prefetched {}", key);
                self.mark_cache_fresh(key);
            }
            Err(e) => tracing::warn!("Failed to save {}: {}", key, e),
        }
    }
}

/// Run `task` over `items` with bounded concurrency, logging panics
async fn guarded_each<'a, T, F, Fut>(items: &'a [T], what: &'static str, task: F)
where
    T: Sync,
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = ()> + 'a,
{
    let tasks: Vec<_> = items
        .iter()
        .map(|item| AssertUnwindSafe(task(item)).catch_unwind())
        .collect();
    stream::iter(tasks)
        .buffer_unordered(SYNC_CONCURRENCY)
        .for_each(|result| async move {
            if let Err(payload) = result {
                tracing::error!("{} panicked: {}", what, panic_message(payload.as_ref()));
            }
        })
        .await;
}
