//! Grout - RomM companion for retro gaming handhelds
//!
//! Headless session runner: connects to the configured RomM host, refreshes
//! the local cache, fills missing artwork, optionally syncs saves and checks
//! for a newer Grout build in the background.

mod layout;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use grout_artwork::{ArtworkPipeline, Viewport};
use grout_cache::{CacheOptions, CacheStore};
use grout_config::{Config, Environment, SaveSyncMode, paths};
use grout_romm::{DownloadManager, RommApi, RommClient};
use grout_saves::{OrphanMatcher, SaveAction, SaveSync, SaveSyncOptions};
use grout_sync::{FreshnessOracle, SyncEngine, SyncOptions, SyncRequest};
use grout_update::{Updater, current_version};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Grout failed: {:#}", e);
            eprintln!("grout: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let env = Environment::from_env().context("Failed to read environment")?;
    let config = Config::load_or_default(&paths::config_path()).context("Failed to load config")?;
    let _log_guard = setup_logging(&config)?;

    tracing::info!(
        cfw = %env.cfw,
        version = current_version(),
        development = env.development,
        "Grout starting"
    );

    let Some(host) = config.primary_host().cloned() else {
        tracing::warn!("No RomM host configured");
        let removed = tokio::task::spawn_blocking(grout_artwork::sweep).await?;
        tracing::debug!(removed, "Artwork sweep finished");
        return Ok(());
    };

    let store = grout_cache::init_global(&host.identity(), CacheOptions::default())
        .context("Failed to open cache")?;

    let session = session(&env, &config, &host, Arc::clone(&store));
    let outcome = tokio::select! {
        result = session => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    };

    shutdown();
    outcome
}

async fn session(
    env: &Environment,
    config: &Config,
    host: &grout_config::Host,
    store: Arc<CacheStore>,
) -> Result<()> {
    let client = RommClient::new(host, config.api_timeout).context("Failed to build RomM client")?;
    let heartbeat = client
        .heartbeat()
        .await
        .with_context(|| format!("RomM server at {} is unreachable", host.base_url()))?;
    client.login().await.context("RomM login failed")?;
    tracing::info!(server = heartbeat.version(), "Connected to RomM");

    let api: Arc<dyn RommApi> = Arc::new(client);
    let oracle = grout_sync::init_oracle(FreshnessOracle::new(Arc::clone(&api), Arc::clone(&store)));
    let options = SyncOptions::from_config(config);

    let platforms = store.get_platforms().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Cached platforms unavailable");
        Vec::new()
    });
    {
        let oracle = Arc::clone(&oracle);
        let kinds = options.collection_kinds.clone();
        spawn_guarded("freshness", async move {
            oracle.run_startup(&platforms, &kinds).await;
        });
    }

    spawn_guarded("artwork sweep", async {
        match tokio::task::spawn_blocking(grout_artwork::sweep).await {
            Ok(removed) => tracing::debug!(removed, "Artwork sweep finished"),
            Err(e) => tracing::warn!(error = %e, "Artwork sweep failed"),
        }
    });

    {
        let cfw = env.cfw;
        let channel = config.release_channel;
        let romm_version = heartbeat.version().to_string();
        spawn_guarded("update check", async move {
            check_for_update(cfw, channel, &romm_version).await;
        });
    }

    let engine = SyncEngine::new(Arc::clone(&api), Arc::clone(&store), oracle, options);
    engine
        .run(SyncRequest::Full)
        .await
        .context("Library sync failed")?;

    if config.download_art {
        fill_artwork(config, Arc::clone(&api), &store).await?;
    }

    if config.save_sync_mode == SaveSyncMode::Manual {
        sync_saves(env, config, api, store).await?;
    }

    Ok(())
}

async fn fill_artwork(config: &Config, api: Arc<dyn RommApi>, store: &CacheStore) -> Result<()> {
    let mut roms = Vec::new();
    for platform in store.get_platforms()? {
        roms.extend(store.get_platform_games(platform.id)?);
    }

    let pipeline = ArtworkPipeline::new(
        api,
        DownloadManager::new(config.download_timeout)?,
        paths::working_dir(),
        Viewport::default(),
    );
    let report = pipeline.fill(&roms).await;
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        "Artwork fill finished"
    );
    Ok(())
}

async fn sync_saves(
    env: &Environment,
    config: &Config,
    api: Arc<dyn RommApi>,
    store: Arc<CacheStore>,
) -> Result<()> {
    let layout = Arc::new(layout::from_config(&env.base_path, config));
    let saves = SaveSync::new(
        Arc::clone(&api),
        Arc::clone(&store),
        layout,
        SaveSyncOptions::from_config(config),
    );

    let mut report = saves.run().await.context("Save sync failed")?;

    if !report.unmatched.is_empty() {
        let orphans = OrphanMatcher::new(api, store).match_all(&report.unmatched).await;
        tracing::info!(
            matched = orphans.matched,
            not_found = orphans.not_found,
            skipped = orphans.skipped,
            failed = orphans.failed,
            "Orphan matching finished"
        );
        // Newly matched ROMs pair through the mapping cache on a second pass
        if orphans.matched > 0 {
            report = saves.run().await.context("Save sync failed")?;
        }
    }

    for failure in report.failures() {
        tracing::warn!(
            game = %failure.game_name,
            action = %failure.action,
            error = failure.error.as_deref().unwrap_or("unknown"),
            "Save transfer failed"
        );
    }
    tracing::info!(
        downloaded = report.count(SaveAction::Download),
        uploaded = report.count(SaveAction::Upload),
        skipped = report.count(SaveAction::Skip),
        unmatched = report.unmatched.len(),
        "Save sync finished"
    );
    Ok(())
}

async fn check_for_update(cfw: grout_config::Cfw, channel: grout_config::ReleaseChannel, romm_version: &str) {
    let updater = match Updater::for_current_exe(cfw, channel) {
        Ok(updater) => updater,
        Err(e) => {
            tracing::warn!(error = %e, "Updater unavailable");
            return;
        }
    };

    match updater.check(current_version(), Some(romm_version)).await {
        Ok(Some(update)) => {
            let mut last_percent = 0;
            let applied = updater
                .apply(&update, |done, total| {
                    if total > 0 {
                        let percent = done * 100 / total;
                        if percent >= last_percent + 25 {
                            last_percent = percent;
                            tracing::debug!(percent, "Downloading update");
                        }
                    }
                })
                .await;
            match applied {
                Ok(()) => tracing::info!(
                    version = %update.latest_version,
                    "Update installed, restart Grout to use it"
                ),
                Err(e) => tracing::warn!(error = %e, "Update failed"),
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Update check failed"),
    }
}

/// Run a background task; a panic is logged instead of taking the process down
fn spawn_guarded<F>(name: &'static str, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task = name, panic = %message, "Background task panicked");
        }
    });
}

fn shutdown() {
    grout_cache::close_global();

    let tmp = paths::tmp_dir();
    if tmp.exists() {
        if let Err(e) = std::fs::remove_dir_all(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "Failed to clear temp directory");
        }
    }
    tracing::info!("Grout stopped");
}

fn setup_logging(config: &Config) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    let log_path = paths::log_path();
    let directory = log_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(paths::working_dir);
    let file_name = log_path
        .file_name()
        .context("Log path has no file name")?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
        .init();

    Ok(guard)
}
