//! In-memory RomM server
//!
//! Implements [`RommApi`] over plain collections so engines can be driven
//! without a network. State sits behind an `Arc<RwLock>` and can be edited
//! between calls.
//!
//! ```no_run
//! use grout_romm::mock::MockRomm;
//!
//! let mock = MockRomm::new();
//! mock.add_platform(1, "snes", "Super Nintendo", 3);
//! mock.add_rom(10, 1, "snes", "Zelda");
//! ```

use crate::models::HeartbeatSystem;
use crate::{
    BasicAuth, Collection, CollectionKind, Device, DeviceRegistration, Firmware, Heartbeat,
    Platform, PlatformBinding, Result, Rom, RomHash, RomPage, RomQuery, RommApi, RommError, Save,
    SaveQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Everything the mock server knows
#[derive(Debug, Default)]
pub struct MockState {
    pub version: String,
    pub binding: PlatformBinding,
    pub platforms: Vec<Platform>,
    pub roms: Vec<Rom>,
    pub collections: HashMap<CollectionKind, Vec<Collection>>,
    pub firmware: HashMap<i64, Vec<Firmware>>,
    pub saves: Vec<Save>,
    pub save_contents: HashMap<i64, Vec<u8>>,
    /// `roms()` fails with a server error for these platforms
    pub failing_platforms: HashSet<i64>,
    pub reject_login: bool,
    /// Applied before listing platforms and ROMs
    pub latency: Option<Duration>,
    /// `updated_at` stamped on the next uploaded save
    pub upload_time: Option<DateTime<Utc>>,
    pub uploads: Vec<(i64, String, Vec<u8>)>,
    pub calls: Vec<String>,
}

const MOCK_BASE_URL: &str = "http://romm.mock";

/// Mock RomM server
#[derive(Debug, Clone)]
pub struct MockRomm {
    state: Arc<RwLock<MockState>>,
    base_url: String,
    auth: Option<BasicAuth>,
}

impl Default for MockRomm {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            base_url: MOCK_BASE_URL.to_string(),
            auth: None,
        }
    }
}

impl MockRomm {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.state_mut().version = "4.0.0".to_string();
        mock
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Credentials reported through [`RommApi::auth`]
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn state(&self) -> RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_platform(&self, id: i64, fs_slug: &str, name: &str, rom_count: i64) {
        self.state_mut().platforms.push(Platform {
            id,
            slug: fs_slug.to_string(),
            fs_slug: fs_slug.to_string(),
            name: name.to_string(),
            api_name: name.to_string(),
            rom_count,
            updated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            ..Default::default()
        });
    }

    pub fn add_rom(&self, id: i64, platform_id: i64, fs_slug: &str, fs_name_no_ext: &str) -> Rom {
        let rom = Rom {
            id,
            platform_id,
            platform_slug: fs_slug.to_string(),
            platform_fs_slug: fs_slug.to_string(),
            name: fs_name_no_ext.to_string(),
            fs_name: format!("{fs_name_no_ext}.bin"),
            fs_name_no_ext: fs_name_no_ext.to_string(),
            fs_extension: "bin".to_string(),
            updated_at: DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap_or_default(),
            ..Default::default()
        };
        self.state_mut().roms.push(rom.clone());
        rom
    }

    pub fn add_save(&self, save: Save, contents: &[u8]) {
        let mut state = self.state_mut();
        state.save_contents.insert(save.id, contents.to_vec());
        state.saves.push(save);
    }

    pub fn set_collections(&self, kind: CollectionKind, collections: Vec<Collection>) {
        self.state_mut().collections.insert(kind, collections);
    }

    pub fn set_firmware(&self, platform_id: i64, firmware: Vec<Firmware>) {
        self.state_mut().firmware.insert(platform_id, firmware);
    }

    /// Calls recorded under `name` (`"rom_by_hash:crc_hash"` for hash lookups)
    pub fn call_count(&self, name: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == name).count()
    }

    pub fn clear_calls(&self) {
        self.state_mut().calls.clear();
    }

    fn record(&self, call: impl Into<String>) {
        self.state_mut().calls.push(call.into());
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn collection_rom_ids(&self, kind: CollectionKind, id: &str) -> Option<Vec<i64>> {
        let state = self.state();
        state
            .collections
            .get(&kind)?
            .iter()
            .find(|c| match kind {
                CollectionKind::Virtual => c.id.virtual_id() == Some(id),
                _ => c.id.romm_id().map(|v| v.to_string()).as_deref() == Some(id),
            })
            .map(|c| c.rom_ids.clone())
    }
}

fn newer(updated_at: DateTime<Utc>, after: Option<DateTime<Utc>>) -> bool {
    after.is_none_or(|after| updated_at > after)
}

#[async_trait]
impl RommApi for MockRomm {
    async fn heartbeat(&self) -> Result<Heartbeat> {
        self.record("heartbeat");
        Ok(Heartbeat {
            system: HeartbeatSystem {
                version: self.state().version.clone(),
            },
        })
    }

    async fn login(&self) -> Result<()> {
        self.record("login");
        if self.state().reject_login {
            return Err(RommError::Unauthorized);
        }
        Ok(())
    }

    async fn platform_binding(&self) -> Result<PlatformBinding> {
        self.record("platform_binding");
        Ok(self.state().binding.clone())
    }

    async fn platforms(&self, updated_after: Option<DateTime<Utc>>) -> Result<Vec<Platform>> {
        self.record("platforms");
        self.delay().await;
        Ok(self
            .state()
            .platforms
            .iter()
            .filter(|p| newer(p.updated_at, updated_after))
            .cloned()
            .collect())
    }

    async fn roms(&self, query: &RomQuery) -> Result<RomPage> {
        self.record("roms");
        self.delay().await;

        if let Some(pid) = query.platform_id {
            if self.state().failing_platforms.contains(&pid) {
                return Err(RommError::ServerError(500));
            }
        }

        let collection_filter = if let Some(id) = query.collection_id {
            self.collection_rom_ids(CollectionKind::Regular, &id.to_string())
        } else if let Some(id) = query.smart_collection_id {
            self.collection_rom_ids(CollectionKind::Smart, &id.to_string())
        } else if let Some(id) = &query.virtual_collection_id {
            self.collection_rom_ids(CollectionKind::Virtual, id)
        } else {
            None
        };

        let mut items: Vec<Rom> = self
            .state()
            .roms
            .iter()
            .filter(|r| query.platform_id.is_none_or(|pid| r.platform_id == pid))
            .filter(|r| collection_filter.as_ref().is_none_or(|ids| ids.contains(&r.id)))
            .filter(|r| newer(r.updated_at, query.updated_after))
            .filter(|r| {
                query
                    .search
                    .as_ref()
                    .is_none_or(|s| r.name.to_lowercase().contains(&s.to_lowercase()))
            })
            .cloned()
            .collect();

        if query.order_dir.as_deref() == Some("desc") {
            items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        }

        let total = items.len() as i64;
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.unwrap_or(total.max(1)).max(0) as usize;
        let items: Vec<Rom> = items.into_iter().skip(offset).take(limit).collect();

        Ok(RomPage {
            items,
            total,
            limit: limit as i64,
            offset: offset as i64,
        })
    }

    async fn rom_by_hash(&self, hash: &RomHash) -> Result<Option<Rom>> {
        let (field, value) = hash.to_pair();
        self.record(format!("rom_by_hash:{field}"));

        let matches = |candidate: &Option<String>| {
            candidate
                .as_deref()
                .is_some_and(|c| !c.is_empty() && c.eq_ignore_ascii_case(value))
        };
        Ok(self
            .state()
            .roms
            .iter()
            .find(|r| match hash {
                RomHash::Crc(_) => matches(&r.crc_hash),
                RomHash::Md5(_) => matches(&r.md5_hash),
                RomHash::Sha1(_) => matches(&r.sha1_hash),
            })
            .cloned())
    }

    async fn rom(&self, id: i64) -> Result<Rom> {
        self.record("rom");
        self.state()
            .roms
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(RommError::Http(404))
    }

    async fn collections(
        &self,
        kind: CollectionKind,
        updated_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Collection>> {
        self.record(format!("collections:{kind}"));
        Ok(self
            .state()
            .collections
            .get(&kind)
            .map(|list| {
                list.iter()
                    .filter(|c| match (c.updated_at, updated_after) {
                        (Some(at), Some(after)) => at > after,
                        _ => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn firmware(&self, platform_id: i64) -> Result<Vec<Firmware>> {
        self.record("firmware");
        Ok(self
            .state()
            .firmware
            .get(&platform_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn saves(&self, query: &SaveQuery) -> Result<Vec<Save>> {
        self.record("saves");
        let state = self.state();
        let platform_roms: Option<HashSet<i64>> = query.platform_id.map(|pid| {
            state
                .roms
                .iter()
                .filter(|r| r.platform_id == pid)
                .map(|r| r.id)
                .collect()
        });

        Ok(state
            .saves
            .iter()
            .filter(|s| query.rom_id.is_none_or(|id| s.rom_id == id))
            .filter(|s| platform_roms.as_ref().is_none_or(|ids| ids.contains(&s.rom_id)))
            .filter(|s| {
                query
                    .emulator
                    .as_ref()
                    .is_none_or(|e| s.emulator.as_ref() == Some(e))
            })
            .cloned()
            .collect())
    }

    async fn download_save(&self, save: &Save) -> Result<Vec<u8>> {
        self.record("download_save");
        self.state()
            .save_contents
            .get(&save.id)
            .cloned()
            .ok_or(RommError::Http(404))
    }

    async fn upload_save(&self, rom_id: i64, emulator: &str, file: &Path) -> Result<Save> {
        self.record("upload_save");
        let contents = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut state = self.state_mut();
        let now = Utc::now();
        let updated_at = state
            .upload_time
            .unwrap_or_else(|| DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now));
        let id = state.saves.iter().map(|s| s.id).max().unwrap_or(0) + 1;

        let save = Save {
            id,
            rom_id,
            file_name: file_name.clone(),
            file_name_no_ext: file_name
                .rsplit_once('.')
                .map(|(base, _)| base.to_string())
                .unwrap_or_else(|| file_name.clone()),
            emulator: Some(emulator.to_string()),
            file_size_bytes: contents.len() as u64,
            updated_at,
            ..Default::default()
        };

        state.uploads.push((rom_id, emulator.to_string(), contents.clone()));
        state.save_contents.insert(id, contents);
        state.saves.push(save.clone());
        Ok(save)
    }

    async fn register_device(&self, device: &DeviceRegistration) -> Result<Device> {
        self.record("register_device");
        Ok(Device {
            id: "1".to_string(),
            name: device.name.clone(),
        })
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth(&self) -> Option<BasicAuth> {
        self.auth.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roms_newest_first_lookup() {
        let mock = MockRomm::new();
        mock.add_rom(1, 1, "snes", "A");
        mock.add_rom(3, 1, "snes", "C");
        mock.add_rom(2, 1, "snes", "B");

        let page = mock
            .roms(&RomQuery::for_platform(1).page(0, 1).newest_first())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, 3);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_hash_lookup_miss() {
        let mock = MockRomm::new();
        let found = mock.rom_by_hash(&RomHash::Crc("DEADBEEF".into())).await.unwrap();
        assert!(found.is_none());
        assert_eq!(mock.call_count("rom_by_hash:crc_hash"), 1);
    }
}
