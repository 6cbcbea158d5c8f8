//! Save-sync runs: pair, plan, execute

use crate::plan::{SaveAction, SyncProposal, dedup_proposals};
use crate::scan::{LocalRomFile, scan_local, strip_ext};
use crate::transfer::{TempCopy, backup, set_mtime, upload_name, upload_scratch_dir, write_save};
use crate::{
    Result, SAVE_SYNC_PAGE_SIZE, SaveSyncError, SaveSyncReport, SaveSyncResult, TRANSFER_CONCURRENCY,
    UnmatchedSave,
};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use grout_cache::CacheStore;
use grout_config::{CfwLayout, Config, paths};
use grout_romm::{Platform, Rom, RomQuery, RommApi, Save, SaveQuery, fetch_all_roms};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SaveSyncOptions {
    /// Scratch space for stamped upload copies
    pub tmp_dir: PathBuf,
    /// Platform slug -> emulator save folder
    pub save_directory_mappings: HashMap<String, String>,
    /// ROM id -> emulator save folder
    pub game_save_overrides: HashMap<i64, String>,
    pub concurrency: usize,
    pub page_size: i64,
}

impl Default for SaveSyncOptions {
    fn default() -> Self {
        Self {
            tmp_dir: paths::tmp_dir(),
            save_directory_mappings: HashMap::new(),
            game_save_overrides: HashMap::new(),
            concurrency: TRANSFER_CONCURRENCY,
            page_size: SAVE_SYNC_PAGE_SIZE,
        }
    }
}

impl SaveSyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            save_directory_mappings: config.save_directory_mappings.clone(),
            game_save_overrides: config.game_save_overrides.clone(),
            ..Default::default()
        }
    }
}

/// Proposals plus the saves that could not be paired
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub proposals: Vec<SyncProposal>,
    pub unmatched: Vec<UnmatchedSave>,
}

pub struct SaveSync {
    api: Arc<dyn RommApi>,
    store: Arc<CacheStore>,
    layout: Arc<dyn CfwLayout>,
    options: SaveSyncOptions,
}

impl SaveSync {
    pub fn new(
        api: Arc<dyn RommApi>,
        store: Arc<CacheStore>,
        layout: Arc<dyn CfwLayout>,
        options: SaveSyncOptions,
    ) -> Self {
        Self {
            api,
            store,
            layout,
            options,
        }
    }

    /// Scan, pair and transfer everything that differs
    pub async fn run(&self) -> Result<SaveSyncReport> {
        let locals = self.scan().await?;
        let plan = self.plan(locals).await?;
        let results = self.execute(plan.proposals).await;

        let report = SaveSyncReport {
            results,
            unmatched: plan.unmatched,
        };
        tracing::info!(
            downloads = report.count(SaveAction::Download),
            uploads = report.count(SaveAction::Upload),
            skipped = report.count(SaveAction::Skip),
            failed = report.failures().count(),
            unmatched = report.unmatched.len(),
            "Save sync finished"
        );
        Ok(report)
    }

    pub async fn scan(&self) -> Result<Vec<LocalRomFile>> {
        let layout = Arc::clone(&self.layout);
        tokio::task::spawn_blocking(move || scan_local(layout.as_ref()))
            .await
            .map_err(|e| SaveSyncError::Task(e.to_string()))
    }

    /// Pair local ROMs with remote records and choose an action for each
    pub async fn plan(&self, locals: Vec<LocalRomFile>) -> Result<SyncPlan> {
        let mut by_platform: BTreeMap<String, Vec<LocalRomFile>> = BTreeMap::new();
        for rom in locals {
            by_platform.entry(rom.platform_fs_slug.clone()).or_default().push(rom);
        }
        if by_platform.is_empty() {
            return Ok(SyncPlan::default());
        }

        let platforms = self.api.platforms(None).await?;
        let mut plan = SyncPlan::default();

        for (slug, locals) in by_platform {
            let Some(platform) = find_platform(&platforms, &slug) else {
                tracing::debug!(platform = %slug, "No remote platform for local folder");
                continue;
            };
            self.plan_platform(platform, locals, &mut plan).await?;
        }

        plan.proposals = dedup_proposals(plan.proposals);
        Ok(plan)
    }

    async fn plan_platform(&self, platform: &Platform, locals: Vec<LocalRomFile>, plan: &mut SyncPlan) -> Result<()> {
        let saves = self.api.saves(&SaveQuery::for_platform(platform.id)).await?;
        let mut newest: HashMap<i64, Save> = HashMap::new();
        for save in saves {
            match newest.get(&save.rom_id) {
                Some(existing) if existing.updated_at >= save.updated_at => {}
                _ => {
                    newest.insert(save.rom_id, save);
                }
            }
        }

        let roms = fetch_all_roms(
            self.api.as_ref(),
            &RomQuery::for_platform(platform.id),
            self.options.page_size,
            |_| {},
        )
        .await?;
        let by_name = index_by_file_name(&roms);

        for local in locals {
            let base = local.base_name().to_string();

            let paired = match self.store.get_filename_mapping(&local.platform_fs_slug, &base) {
                Ok(Some(mapping)) => Some((mapping.rom_id, mapping.rom_name)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(file = %local.file_name, error = %e, "Filename mapping lookup failed");
                    None
                }
            };

            let paired = match paired {
                Some(found) => Some(found),
                None => match by_name.get(base.as_str()) {
                    Some(rom) => {
                        if let Err(e) = self.store.save_filename_mapping(&local.platform_fs_slug, &base, rom.id, &rom.name) {
                            tracing::warn!(file = %local.file_name, error = %e, "Failed to remember filename mapping");
                        }
                        Some((rom.id, rom.name.clone()))
                    }
                    None => None,
                },
            };

            let Some((rom_id, rom_name)) = paired else {
                if let Some(save) = &local.save {
                    plan.unmatched.push(UnmatchedSave {
                        platform_fs_slug: local.platform_fs_slug.clone(),
                        rom_file_name: local.file_name.clone(),
                        rom_path: local.path.clone(),
                        save_path: save.path.clone(),
                    });
                }
                continue;
            };

            let remote = newest.get(&rom_id).cloned();
            if local.save.is_none() && remote.is_none() {
                continue;
            }
            plan.proposals.push(SyncProposal::new(rom_id, rom_name, local, remote));
        }

        Ok(())
    }

    /// Carry out proposals, at most `concurrency` at a time, in order
    pub async fn execute(&self, proposals: Vec<SyncProposal>) -> Vec<SaveSyncResult> {
        stream::iter(proposals)
            .map(|p| async move {
                let outcome = match p.action {
                    SaveAction::Download => self.download(&p).await,
                    SaveAction::Upload => self.upload(&p).await,
                    SaveAction::Skip => Ok(p.local_save_path().cloned().unwrap_or_default()),
                };

                let (success, error, file_path) = match outcome {
                    Ok(path) => (true, None, path),
                    Err(e) => {
                        tracing::warn!(rom = %p.rom_name, action = %p.action, error = %e, "Save transfer failed");
                        (false, Some(e.to_string()), p.local_save_path().cloned().unwrap_or_default())
                    }
                };

                SaveSyncResult {
                    game_name: p.rom_name.clone(),
                    rom_display_name: strip_ext(&p.local.file_name).to_string(),
                    action: p.action,
                    success,
                    error,
                    file_path,
                }
            })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await
    }

    async fn download(&self, p: &SyncProposal) -> Result<PathBuf> {
        let remote = p.remote.as_ref().ok_or(SaveSyncError::MissingSave(p.rom_id))?;

        let dir = self.resolve_save_dir(&p.local.platform_fs_slug, p.rom_id)?;
        let ext = match remote.extension() {
            "" => p
                .local
                .save
                .as_ref()
                .and_then(|s| s.file_name.rsplit_once('.').map(|(_, e)| e.to_string()))
                .unwrap_or_else(|| "srm".to_string()),
            ext => ext.to_string(),
        };
        let destination = dir.join(format!("{}.{}", p.local.base_name(), ext));

        if destination.is_file() {
            let copy = backup(&destination, Utc::now()).await?;
            tracing::debug!(backup = %copy.display(), "Backed up local save");
        }

        let contents = self.api.download_save(remote).await?;
        write_save(&destination, &contents).await?;
        set_mtime(&destination, remote.updated_at)?;

        tracing::info!(rom = %p.rom_name, path = %destination.display(), "Downloaded save");
        Ok(destination)
    }

    async fn upload(&self, p: &SyncProposal) -> Result<PathBuf> {
        let save = p.local.save.as_ref().ok_or(SaveSyncError::MissingSave(p.rom_id))?;

        let emulator = save
            .path
            .parent()
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| save.emulator.clone());

        let stamped = upload_name(&save.file_name, save.last_modified);
        let scratch = upload_scratch_dir(&self.options.tmp_dir, p.rom_id, &emulator);
        let copy = TempCopy::create(&save.path, &scratch, &stamped).await?;
        let stored = self.api.upload_save(p.rom_id, &emulator, copy.path()).await?;
        drop(copy);

        set_mtime(&save.path, stored.updated_at)?;

        tracing::info!(rom = %p.rom_name, save_id = stored.id, "Uploaded save");
        Ok(save.path.clone())
    }

    /// Folder a downloaded save goes to.
    ///
    /// Precedence: per-ROM override, per-platform mapping, then the layout's
    /// preferred folder. Overrides naming a folder the platform does not use
    /// are ignored.
    pub fn resolve_save_dir(&self, fs_slug: &str, rom_id: i64) -> Result<PathBuf> {
        let folders = self.layout.save_folders(fs_slug);

        if let Some(folder) = self.options.game_save_overrides.get(&rom_id) {
            if folders.iter().any(|f| f == folder) {
                return Ok(self.layout.save_root().join(folder));
            }
            tracing::warn!(rom_id, folder = %folder, platform = %fs_slug, "Ignoring save override for unknown folder");
        }

        if let Some(folder) = self.options.save_directory_mappings.get(fs_slug) {
            return Ok(self.layout.save_root().join(folder));
        }

        folders
            .first()
            .map(|f| self.layout.save_root().join(f))
            .ok_or_else(|| SaveSyncError::NoSaveFolder(fs_slug.to_string()))
    }
}

fn find_platform<'a>(platforms: &'a [Platform], fs_slug: &str) -> Option<&'a Platform> {
    platforms
        .iter()
        .find(|p| p.fs_slug == fs_slug)
        .or_else(|| platforms.iter().find(|p| p.slug == fs_slug))
}

/// Remote ROMs keyed by file name without extension; first entry wins
fn index_by_file_name(roms: &[Rom]) -> HashMap<&str, &Rom> {
    let mut index = HashMap::new();
    for rom in roms {
        for key in [rom.fs_name_no_ext.as_str(), strip_ext(&rom.fs_name_no_ext)] {
            if !key.is_empty() {
                index.entry(key).or_insert(rom);
            }
        }
    }
    index
}
