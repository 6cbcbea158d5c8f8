//! End-to-end sync runs against the in-memory RomM server

use grout_cache::{CacheStore, PlatformSyncState, keys};
use grout_romm::mock::MockRomm;
use grout_romm::{Collection, CollectionId, CollectionKind, Rom};
use grout_sync::{FreshnessOracle, SyncEngine, SyncIcon, SyncOptions, SyncRequest};
use std::sync::Arc;
use std::time::Duration;

struct SyncTestEnv {
    mock: Arc<MockRomm>,
    store: Arc<CacheStore>,
    oracle: Arc<FreshnessOracle>,
    engine: SyncEngine,
}

impl SyncTestEnv {
    fn new() -> Self {
        Self::with_options(SyncOptions::default())
    }

    fn with_options(options: SyncOptions) -> Self {
        let mock = Arc::new(MockRomm::new());
        let store = Arc::new(CacheStore::in_memory().unwrap());
        let oracle = Arc::new(FreshnessOracle::new(mock.clone(), store.clone()));
        let engine = SyncEngine::new(mock.clone(), store.clone(), oracle.clone(), options);
        Self {
            mock,
            store,
            oracle,
            engine,
        }
    }

    /// P1 with three ROMs, P2 empty
    fn seed_first_run(&self) {
        self.mock.add_platform(1, "snes", "Super Nintendo", 3);
        self.mock.add_platform(2, "gb", "Game Boy", 0);
        for id in [10, 11, 12] {
            self.mock.add_rom(id, 1, "snes", &format!("Game {id}"));
        }
    }

    fn game_ids(&self, platform_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .store
            .get_platform_games(platform_id)
            .unwrap()
            .iter()
            .map(|g| g.id)
            .collect();
        ids.sort();
        ids
    }
}

#[tokio::test]
async fn test_first_run_full_sync() {
    let env = SyncTestEnv::new();
    env.seed_first_run();

    env.engine.run(SyncRequest::Full).await.unwrap();

    let mut platform_ids: Vec<i64> = env.store.get_platforms().unwrap().iter().map(|p| p.id).collect();
    platform_ids.sort();
    assert_eq!(platform_ids, vec![1, 2]);
    assert_eq!(env.game_ids(1), vec![10, 11, 12]);
    assert!(env.store.get_platform_games(2).unwrap().is_empty());

    for key in [
        keys::PLATFORMS_REFRESHED_AT,
        keys::GAMES_REFRESHED_AT,
        keys::COLLECTIONS_REFRESHED_AT,
    ] {
        assert!(env.store.get_last_refresh_time(key).unwrap().is_some(), "{key} missing");
    }
    assert_eq!(env.engine.icon(), Some(SyncIcon::Synced));
    assert!((env.engine.progress() - 1.0).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_incremental_noop() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();

    let games_before = env.store.get_last_refresh_time(keys::GAMES_REFRESHED_AT).unwrap().unwrap();
    let platforms_before = env.store.get_platforms().unwrap();
    let snes_before = env.store.get_platform_games(1).unwrap();
    env.mock.clear_calls();

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert_eq!(env.mock.call_count("platforms"), 1);
    let games_after = env.store.get_last_refresh_time(keys::GAMES_REFRESHED_AT).unwrap().unwrap();
    assert!(games_after > games_before);
    assert_eq!(env.store.get_platforms().unwrap(), platforms_before);
    assert_eq!(env.store.get_platform_games(1).unwrap(), snes_before);
}

#[tokio::test]
async fn test_incremental_merges_changed_games() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();

    let mut changed: Rom = env.mock.state().roms[0].clone();
    changed.name = "Renamed".into();
    changed.updated_at = chrono::Utc::now() + chrono::Duration::hours(1);
    env.mock.state_mut().roms[0] = changed.clone();

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert_eq!(env.game_ids(1), vec![10, 11, 12]);
    let cached = env.store.get_game(changed.id).unwrap().unwrap();
    assert_eq!(cached.name, "Renamed");
}

#[tokio::test]
async fn test_zero_platforms() {
    let env = SyncTestEnv::new();

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert!((env.engine.progress() - 1.0).abs() < f32::EPSILON);
    assert_eq!(env.engine.icon(), Some(SyncIcon::Synced));
    assert_eq!(env.mock.call_count("roms"), 0);
    assert_eq!(env.mock.call_count("firmware"), 0);
    assert_eq!(env.mock.call_count("collections:regular"), 0);
}

#[tokio::test]
async fn test_platform_failure_is_recorded_not_fatal() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.mock.state_mut().failing_platforms.insert(1);

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert_eq!(env.engine.icon(), Some(SyncIcon::Synced));
    let status = env.store.platform_sync_status(1).unwrap().unwrap();
    assert_eq!(status.state, PlatformSyncState::Failed);
    assert_eq!(env.store.failed_platform_ids().unwrap(), vec![1]);
    assert_eq!(
        env.store.platform_sync_status(2).unwrap().unwrap().state,
        PlatformSyncState::Ok
    );

    // the server recovers; the next full sync retries the failed platform
    env.mock.state_mut().failing_platforms.clear();
    env.engine.run(SyncRequest::Full).await.unwrap();

    assert!(env.store.failed_platform_ids().unwrap().is_empty());
    assert_eq!(env.game_ids(1), vec![10, 11, 12]);
}

#[tokio::test]
async fn test_platform_subset_keeps_games_checkpoint() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();
    let checkpoint = env.store.get_last_refresh_time(keys::GAMES_REFRESHED_AT).unwrap();

    env.mock.add_rom(13, 1, "snes", "Game 13");
    env.mock.state_mut().roms.last_mut().unwrap().updated_at =
        chrono::Utc::now() + chrono::Duration::hours(1);
    env.mock.clear_calls();

    let platform = env.store.get_platform(1).unwrap();
    env.engine
        .run(SyncRequest::PlatformSubset(vec![platform]))
        .await
        .unwrap();

    assert_eq!(env.game_ids(1), vec![10, 11, 12, 13]);
    assert!(env.mock.call_count("roms") > 0);
    assert_eq!(
        env.store.get_last_refresh_time(keys::GAMES_REFRESHED_AT).unwrap(),
        checkpoint
    );
    assert_eq!(env.mock.call_count("collections:regular"), 1);
}

#[tokio::test]
async fn test_fresh_platforms_answered_by_oracle() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();

    let platforms = env.store.get_platforms().unwrap();
    env.oracle.run_startup(&platforms, &[]).await;
    env.mock.clear_calls();

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert_eq!(env.mock.call_count("roms"), 0);
    assert_eq!(env.engine.icon(), Some(SyncIcon::Synced));

    // startup verification is spent; later syncs fetch again
    env.mock.clear_calls();
    env.engine.run(SyncRequest::Full).await.unwrap();
    assert!(env.mock.call_count("roms") > 0);
}

#[tokio::test]
async fn test_platform_subset_ignores_startup_verification() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();

    let platforms = env.store.get_platforms().unwrap();
    env.oracle.run_startup(&platforms, &[]).await;
    env.mock.add_rom(13, 1, "snes", "Game 13");
    env.mock.state_mut().roms.last_mut().unwrap().updated_at =
        chrono::Utc::now() + chrono::Duration::hours(1);
    env.mock.clear_calls();

    let platform = env.store.get_platform(1).unwrap();
    env.engine
        .run(SyncRequest::PlatformSubset(vec![platform]))
        .await
        .unwrap();

    assert!(env.mock.call_count("roms") > 0);
    assert_eq!(env.game_ids(1), vec![10, 11, 12, 13]);
}

#[tokio::test]
async fn test_first_run_import_uses_bulk_load() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.mock.state_mut().latency = Some(Duration::from_millis(50));

    let watcher = async {
        for _ in 0..300 {
            if env.store.is_bulk_load_mode() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    };
    let (result, seen) = tokio::join!(env.engine.run(SyncRequest::Full), watcher);

    result.unwrap();
    assert!(seen, "bulk load mode never enabled during first-run import");
    assert!(!env.store.is_bulk_load_mode());
    assert_eq!(env.game_ids(1), vec![10, 11, 12]);

    // incremental syncs write through the normal journal
    let watcher = async {
        for _ in 0..40 {
            if env.store.is_bulk_load_mode() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    };
    let (result, seen) = tokio::join!(env.engine.run(SyncRequest::Full), watcher);
    result.unwrap();
    assert!(!seen);
}

#[tokio::test]
async fn test_mappings_kept_for_failed_platforms() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.store.save_filename_mapping("snes", "Game 10 (USA)", 10, "Game 10").unwrap();
    env.store.save_filename_mapping("gb", "Gone", 99, "Gone").unwrap();
    env.mock.state_mut().failing_platforms.insert(1);

    env.engine.run(SyncRequest::Full).await.unwrap();

    // snes never fetched, so its mapping cannot be judged stale
    assert!(env.store.get_filename_mapping("snes", "Game 10 (USA)").unwrap().is_some());
    assert!(env.store.get_filename_mapping("gb", "Gone").unwrap().is_none());
}

#[tokio::test]
async fn test_collections_only() {
    let env = SyncTestEnv::with_options(SyncOptions {
        collection_kinds: vec![CollectionKind::Regular, CollectionKind::Virtual],
        ..Default::default()
    });
    env.seed_first_run();
    env.engine.run(SyncRequest::Full).await.unwrap();

    env.mock.set_collections(
        CollectionKind::Regular,
        vec![Collection::from_raw(CollectionKind::Regular, r#"{"id":1,"name":"Favs","rom_ids":[10,12]}"#).unwrap()],
    );
    env.mock.set_collections(
        CollectionKind::Virtual,
        vec![Collection::from_raw(CollectionKind::Virtual, r#"{"id":"1","name":"Action","rom_ids":[11]}"#).unwrap()],
    );
    env.mock.clear_calls();

    env.engine.run(SyncRequest::CollectionsOnly).await.unwrap();

    assert_eq!(env.mock.call_count("platforms"), 0);
    assert_eq!(env.mock.call_count("roms"), 0);
    assert_eq!(env.store.get_collections().unwrap().len(), 2);
    let favs = env.store.get_collection_games(&CollectionId::Regular(1)).unwrap();
    assert_eq!(favs.len(), 2);
    let action = env
        .store
        .get_collection_games(&CollectionId::Virtual("1".into()))
        .unwrap();
    assert_eq!(action[0].id, 11);
    assert_eq!(env.engine.icon(), Some(SyncIcon::Synced));
}

#[tokio::test]
async fn test_bios_availability_persisted() {
    let env = SyncTestEnv::new();
    env.seed_first_run();
    env.mock.set_firmware(
        1,
        vec![grout_romm::Firmware {
            id: 1,
            file_name: "bios.rom".into(),
            ..Default::default()
        }],
    );

    env.engine.run(SyncRequest::Full).await.unwrap();

    assert_eq!(env.store.has_bios(1).unwrap(), Some(true));
    assert_eq!(env.store.has_bios(2).unwrap(), Some(false));
    assert_eq!(env.oracle.has_bios(1), Some(true));
}
