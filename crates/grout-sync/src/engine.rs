//! Background sync engine
//!
//! A single worker drains a request channel of capacity one. Enqueueing
//! never blocks: when a request is already waiting the new one is dropped,
//! so rapid user input cannot pile up syncs while the latest intent still
//! runs. Each sync checks the worker's stop signal at phase boundaries and
//! at every per-platform task.

use crate::freshness::{CacheKey, FreshnessOracle};
use crate::icon::{IconSlot, SyncIcon};
use crate::{GAMES_PROGRESS_CAP, SYNC_CONCURRENCY, SYNC_PAGE_SIZE, SyncError, panic_message};
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt, future, stream};
use grout_cache::{CacheStore, keys};
use grout_config::Config;
use grout_romm::{CollectionKind, Platform, RomQuery, RommApi, fetch_all_roms};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// Platforms, games and collections
    Full,
    CollectionsOnly,
    /// Games of the given platforms only
    PlatformSubset(Vec<Platform>),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub concurrency: usize,
    pub page_size: i64,
    /// Collection types fetched by the collections phase
    pub collection_kinds: Vec<CollectionKind>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: SYNC_CONCURRENCY,
            page_size: SYNC_PAGE_SIZE,
            collection_kinds: vec![CollectionKind::Regular],
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        let mut collection_kinds = Vec::new();
        if config.show_collections {
            collection_kinds.push(CollectionKind::Regular);
        }
        if config.show_smart_collections {
            collection_kinds.push(CollectionKind::Smart);
        }
        if config.show_virtual_collections {
            collection_kinds.push(CollectionKind::Virtual);
        }

        Self {
            collection_kinds,
            ..Default::default()
        }
    }
}

/// Lower bound for `updated_after` when fetching games
enum GamesSince {
    /// One checkpoint for every platform; `None` fetches everything
    Global(Option<DateTime<Utc>>),
    /// Each platform's own last successful sync
    PerPlatform,
}

#[derive(Clone)]
struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// A signal nobody can raise
    fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self(receiver)
    }

    fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.is_stopped() {
            Err(SyncError::Stopped)
        } else {
            Ok(())
        }
    }
}

struct Worker {
    requests: mpsc::Sender<SyncRequest>,
    stop: watch::Sender<bool>,
}

struct Shared {
    api: Arc<dyn RommApi>,
    store: Arc<CacheStore>,
    oracle: Arc<FreshnessOracle>,
    options: SyncOptions,
    running: AtomicBool,
    progress: AtomicU32,
    icon: IconSlot,
}

pub struct SyncEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn RommApi>,
        store: Arc<CacheStore>,
        oracle: Arc<FreshnessOracle>,
        options: SyncOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                store,
                oracle,
                options,
                running: AtomicBool::new(false),
                progress: AtomicU32::new(0f32.to_bits()),
                icon: IconSlot::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue a full sync; a no-op while one is running
    pub fn start(&self) -> bool {
        if self.is_running() {
            return false;
        }
        self.enqueue(SyncRequest::Full)
    }

    /// Stop the current worker and queue a full sync on a fresh one
    pub fn restart(&self) -> bool {
        self.stop();
        self.enqueue(SyncRequest::Full)
    }

    pub fn sync_collections(&self) -> bool {
        self.enqueue(SyncRequest::CollectionsOnly)
    }

    pub fn sync_platforms(&self, platforms: Vec<Platform>) -> bool {
        self.enqueue(SyncRequest::PlatformSubset(platforms))
    }

    /// Signal the worker to stop; an in-flight sync returns at its next boundary
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            tracing::info!("Sync worker stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn set_synced(&self) {
        self.shared.icon.set(SyncIcon::Synced);
    }

    /// `None` before the first sync
    pub fn icon(&self) -> Option<SyncIcon> {
        self.shared.icon.get()
    }

    pub fn progress(&self) -> f32 {
        self.shared.progress()
    }

    /// Run a request on the caller's task, bypassing the queue
    pub async fn run(&self, request: SyncRequest) -> Result<(), SyncError> {
        self.shared.run_guarded(request, &StopSignal::never()).await
    }

    /// Hand a request to the worker, starting it on first use.
    ///
    /// Returns `false` when the request was coalesced into one already queued.
    fn enqueue(&self, request: SyncRequest) -> bool {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let worker = slot.get_or_insert_with(|| self.spawn_worker());

        match worker.requests.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Sync already queued, dropping request");
                false
            }
            Err(TrySendError::Closed(request)) => {
                let worker = self.spawn_worker();
                let sent = worker.requests.try_send(request).is_ok();
                *slot = Some(worker);
                sent
            }
        }
    }

    fn spawn_worker(&self) -> Worker {
        let (requests, mut receiver) = mpsc::channel(1);
        let (stop, stop_receiver) = watch::channel(false);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let stop = StopSignal(stop_receiver);
            while let Some(request) = receiver.recv().await {
                if stop.is_stopped() {
                    break;
                }
                let _ = shared.run_guarded(request, &stop).await;
            }
            tracing::debug!("Sync worker exited");
        });

        Worker { requests, stop }
    }
}

impl Shared {
    fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::SeqCst))
    }

    fn set_progress(&self, value: f32) {
        self.progress.store(value.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    /// Count `n` more games against `expected`, capped for the games phase
    fn advance(&self, counter: &AtomicI64, n: i64, expected: i64) {
        let done = counter.fetch_add(n, Ordering::SeqCst) + n;
        self.set_progress((done as f32 / expected as f32).min(GAMES_PROGRESS_CAP));
    }

    fn finish(&self) {
        self.set_progress(1.0);
        self.icon.set(SyncIcon::Synced);
    }

    async fn run_guarded(&self, request: SyncRequest, stop: &StopSignal) -> Result<(), SyncError> {
        let previous_icon = self.icon.get();
        self.running.store(true, Ordering::SeqCst);

        let outcome = AssertUnwindSafe(self.run(request, stop)).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SyncError::Stopped)) => {
                tracing::info!("Sync stopped");
                self.icon.restore(previous_icon);
                Err(SyncError::Stopped)
            }
            Ok(Err(e)) => {
                tracing::error!("Sync failed: {}", e);
                self.icon.set(SyncIcon::Alert);
                Err(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!("Sync panicked: {}", message);
                self.icon.set(SyncIcon::Alert);
                Err(SyncError::Panicked(message))
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, request: SyncRequest, stop: &StopSignal) -> Result<(), SyncError> {
        match request {
            SyncRequest::Full => {
                self.full_sync(stop).await?;
                self.retry_failed_platforms(stop).await
            }
            SyncRequest::CollectionsOnly => {
                self.icon.set(SyncIcon::Syncing);
                self.set_progress(0.0);
                self.sync_collections(stop).await?;
                self.finish();
                Ok(())
            }
            SyncRequest::PlatformSubset(platforms) => {
                self.icon.set(SyncIcon::Syncing);
                self.set_progress(0.0);
                self.sync_games(&platforms, GamesSince::PerPlatform, stop).await?;
                self.finish();
                Ok(())
            }
        }
    }

    async fn full_sync(&self, stop: &StopSignal) -> Result<(), SyncError> {
        tracing::info!("Starting full sync");
        self.icon.set(SyncIcon::Syncing);
        self.set_progress(0.0);

        let store = &self.store;
        let has_games = store.game_count()? > 0;
        let platforms_checkpoint = store.get_last_refresh_time(keys::PLATFORMS_REFRESHED_AT)?;
        let games_checkpoint = if has_games {
            store.get_last_refresh_time(keys::GAMES_REFRESHED_AT)?
        } else {
            None
        };

        // First run imports everything, so relax durability until the games are in
        let bulk = if has_games { None } else { Some(store.bulk_load()?) };

        match platforms_checkpoint.filter(|_| has_games) {
            None => {
                let platforms = self.api.platforms(None).await?;
                tracing::info!("Importing {} platforms", platforms.len());
                store.save_platforms(&platforms)?;
                store.record_refresh_time(keys::PLATFORMS_REFRESHED_AT)?;
            }
            Some(since) => match self.api.platforms(Some(since)).await {
                Ok(delta) => {
                    tracing::debug!("{} platforms changed since {}", delta.len(), since);
                    store.merge_platforms(&delta)?;
                    store.record_refresh_time(keys::PLATFORMS_REFRESHED_AT)?;
                }
                Err(e) => tracing::warn!("Platform delta fetch failed, continuing: {}", e),
            },
        }
        stop.check()?;

        let platforms = store.get_platforms()?;
        if platforms.is_empty() {
            tracing::info!("Server has no platforms");
            self.finish();
            return Ok(());
        }

        let fetch_started = Utc::now();
        self.sync_games(&platforms, GamesSince::Global(games_checkpoint), stop)
            .await?;
        store.record_refresh_time_at(keys::GAMES_REFRESHED_AT, fetch_started)?;
        drop(bulk);
        stop.check()?;

        self.sync_collections(stop).await?;
        self.finish();
        tracing::info!("Full sync complete");
        Ok(())
    }

    /// Games and BIOS availability for `platforms`, then mapping cleanup
    async fn sync_games(
        &self,
        platforms: &[Platform],
        since: GamesSince,
        stop: &StopSignal,
    ) -> Result<(), SyncError> {
        let expected = platforms
            .iter()
            .map(|p| p.rom_count.max(0))
            .sum::<i64>()
            .max(1);
        let counter = AtomicI64::new(0);
        let concurrency = self.options.concurrency.max(1);

        let games: Vec<_> = platforms
            .iter()
            .map(|p| self.sync_platform_games(p, &since, &counter, expected, stop))
            .collect();
        let games = stream::iter(games).buffered(concurrency).collect::<Vec<_>>();
        let bios: Vec<_> = platforms.iter().map(|p| self.sync_bios(p, stop)).collect();
        let bios = stream::iter(bios).buffer_unordered(concurrency).collect::<Vec<_>>();

        let (games, bios) = tokio::join!(games, bios);
        bios.into_iter().collect::<Result<Vec<()>, _>>()?;

        let mut current = Vec::new();
        for (platform, result) in platforms.iter().zip(games) {
            if result? {
                current.extend(
                    [platform.fs_slug.as_str(), platform.slug.as_str()]
                        .into_iter()
                        .filter(|slug| !slug.is_empty()),
                );
            }
        }
        // Mappings of platforms whose fetch failed still point at games we never saw
        self.store.prune_stale_mappings(&current)?;
        self.set_progress(GAMES_PROGRESS_CAP);
        Ok(())
    }

    async fn sync_platform_games(
        &self,
        platform: &Platform,
        since: &GamesSince,
        counter: &AtomicI64,
        expected: i64,
        stop: &StopSignal,
    ) -> Result<bool, SyncError> {
        stop.check()?;

        let key = CacheKey::Platform(platform.id);
        if self.oracle.wait_for_prefetch(&key).await {
            tracing::debug!("Waited for prefetch of {}", key);
        }
        // Startup verification covers exactly one full sync; subsets always fetch
        if matches!(since, GamesSince::Global(_)) && self.oracle.take_verified(&key) {
            tracing::debug!("{} verified at startup, skipping", key);
            self.advance(counter, platform.rom_count.max(0), expected);
            return Ok(true);
        }

        let updated_after = match since {
            GamesSince::Global(checkpoint) => *checkpoint,
            GamesSince::PerPlatform => self
                .store
                .platform_sync_status(platform.id)?
                .and_then(|status| status.last_successful_sync),
        };

        self.store.mark_platform_sync_pending(platform.id)?;
        let query = RomQuery::for_platform(platform.id).updated_after(updated_after);
        let fetched = fetch_all_roms(self.api.as_ref(), &query, self.options.page_size, |n| {
            self.advance(counter, n as i64, expected)
        })
        .await;

        let current = match fetched {
            Ok(games) => {
                if updated_after.is_some() {
                    self.store.merge_games(&games)?;
                } else {
                    self.store.save_platform_games(platform.id, &games)?;
                }
                self.store
                    .record_platform_sync_success(platform.id, games.len() as i64)?;
                self.oracle.mark_cache_fresh(key);
                tracing::debug!("Synced {} games for {}", games.len(), platform.display_name());
                true
            }
            Err(e) => {
                tracing::warn!("Failed to sync games for {}: {}", platform.display_name(), e);
                self.store.record_platform_sync_failure(platform.id)?;
                self.oracle.mark_cache_stale(key);
                false
            }
        };

        stop.check()?;
        Ok(current)
    }

    async fn sync_bios(&self, platform: &Platform, stop: &StopSignal) -> Result<(), SyncError> {
        stop.check()?;

        match self.api.firmware(platform.id).await {
            Ok(firmware) => {
                let has_bios = !firmware.is_empty();
                self.store.set_bios_availability(platform.id, has_bios)?;
                self.oracle.set_bios(platform.id, has_bios);
            }
            Err(e) => tracing::warn!("BIOS check failed for {}: {}", platform.display_name(), e),
        }
        Ok(())
    }

    async fn sync_collections(&self, stop: &StopSignal) -> Result<(), SyncError> {
        let kinds = &self.options.collection_kinds;
        let fetched = future::join_all(kinds.iter().map(|kind| self.api.collections(*kind, None))).await;

        let mut collections = Vec::new();
        for result in fetched {
            collections.extend(result?);
        }
        stop.check()?;

        self.store.save_collections(&collections)?;
        self.store.save_collection_games(&collections)?;
        self.store.record_refresh_time(keys::COLLECTIONS_REFRESHED_AT)?;

        for collection in &collections {
            self.oracle
                .mark_cache_fresh(CacheKey::Collection(collection.id.clone()));
        }
        tracing::info!("Synced {} collections", collections.len());
        Ok(())
    }

    /// Re-run platforms whose last attempt failed
    async fn retry_failed_platforms(&self, stop: &StopSignal) -> Result<(), SyncError> {
        let failed = self.store.failed_platform_ids()?;
        if failed.is_empty() {
            return Ok(());
        }

        let platforms: Vec<Platform> = self
            .store
            .get_platforms()?
            .into_iter()
            .filter(|p| failed.contains(&p.id))
            .collect();
        tracing::info!("Retrying {} failed platforms", platforms.len());

        self.sync_games(&platforms, GamesSince::PerPlatform, stop).await?;
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grout_romm::mock::MockRomm;
    use std::time::Duration;

    fn engine(mock: &Arc<MockRomm>) -> (SyncEngine, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::in_memory().unwrap());
        let oracle = Arc::new(FreshnessOracle::new(mock.clone(), store.clone()));
        let engine = SyncEngine::new(mock.clone(), store.clone(), oracle, SyncOptions::default());
        (engine, store)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            show_collections: false,
            show_smart_collections: true,
            show_virtual_collections: true,
            ..Default::default()
        };
        let options = SyncOptions::from_config(&config);
        assert_eq!(
            options.collection_kinds,
            vec![CollectionKind::Smart, CollectionKind::Virtual]
        );
        assert_eq!(options.concurrency, SYNC_CONCURRENCY);
    }

    #[test]
    fn test_progress_is_capped_during_games() {
        let mock = Arc::new(MockRomm::new());
        let (engine, _) = engine(&mock);
        let counter = AtomicI64::new(0);

        engine.shared.advance(&counter, 5, 10);
        assert!((engine.progress() - 0.5).abs() < f32::EPSILON);
        engine.shared.advance(&counter, 50, 10);
        assert!((engine.progress() - GAMES_PROGRESS_CAP).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_requests_coalesce_while_running() {
        let mock = Arc::new(MockRomm::new());
        mock.add_platform(1, "snes", "SNES", 1);
        mock.state_mut().latency = Some(Duration::from_millis(200));
        let (engine, _) = engine(&mock);

        assert!(engine.start());
        wait_until(|| engine.is_running()).await;

        assert!(!engine.start());
        assert!(engine.sync_collections());
        assert!(!engine.sync_collections());
        assert!(!engine.sync_platforms(Vec::new()));

        wait_until(|| !engine.is_running() && engine.icon() == Some(SyncIcon::Synced)).await;
        engine.stop();
    }

    #[tokio::test]
    async fn test_stop_returns_early() {
        let mock = Arc::new(MockRomm::new());
        mock.add_platform(1, "snes", "SNES", 1);
        mock.add_rom(10, 1, "snes", "Zelda");
        mock.state_mut().latency = Some(Duration::from_millis(100));
        let (engine, store) = engine(&mock);

        assert!(engine.start());
        wait_until(|| engine.is_running()).await;
        engine.stop();
        wait_until(|| !engine.is_running()).await;

        assert_eq!(engine.icon(), None);
        assert!(
            store
                .get_last_refresh_time(keys::COLLECTIONS_REFRESHED_AT)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_cache_failure_sets_alert() {
        let mock = Arc::new(MockRomm::new());
        let (engine, store) = engine(&mock);
        store.close();

        let result = engine.run(SyncRequest::CollectionsOnly).await;

        assert!(matches!(result, Err(SyncError::Cache(_))));
        assert_eq!(engine.icon(), Some(SyncIcon::Alert));
        assert!(!engine.is_running());
    }
}
