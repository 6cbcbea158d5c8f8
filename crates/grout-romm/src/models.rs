//! RomM API payloads
//!
//! Entities that are cached keep the server payload verbatim in `raw` so
//! fields this client does not model survive a cache round trip.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A platform as reported by `/api/platforms`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platform {
    pub id: i64,
    #[serde(deserialize_with = "null_default")]
    pub slug: String,
    #[serde(deserialize_with = "null_default")]
    pub fs_slug: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub custom_name: String,
    #[serde(deserialize_with = "null_default")]
    pub rom_count: i64,
    #[serde(deserialize_with = "datetime")]
    pub updated_at: DateTime<Utc>,

    /// Name before local disambiguation
    #[serde(skip)]
    pub api_name: String,
    #[serde(skip)]
    pub has_bios: bool,
    #[serde(skip)]
    pub raw: String,
}

impl Platform {
    /// Parse a platform, keeping the payload verbatim
    pub fn from_raw(raw: &str) -> serde_json::Result<Self> {
        let mut platform: Platform = serde_json::from_str(raw)?;
        platform.api_name = platform.name.clone();
        platform.raw = raw.to_string();
        Ok(platform)
    }

    /// `custom_name` when set, otherwise the server name
    pub fn display_name(&self) -> &str {
        if self.custom_name.trim().is_empty() {
            if self.api_name.is_empty() {
                &self.name
            } else {
                &self.api_name
            }
        } else {
            &self.custom_name
        }
    }
}

/// One file belonging to a (possibly multi-file) ROM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RomFile {
    pub id: i64,
    #[serde(deserialize_with = "null_default")]
    pub file_name: String,
    #[serde(deserialize_with = "null_default")]
    pub file_path: String,
    #[serde(deserialize_with = "null_default")]
    pub file_size_bytes: u64,
}

/// A ROM as reported by `/api/roms`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rom {
    pub id: i64,
    pub platform_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub platform_slug: String,
    #[serde(deserialize_with = "null_default")]
    pub platform_fs_slug: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub fs_name: String,
    #[serde(deserialize_with = "null_default")]
    pub fs_name_no_ext: String,
    #[serde(deserialize_with = "null_default")]
    pub fs_extension: String,
    pub crc_hash: Option<String>,
    pub md5_hash: Option<String>,
    pub sha1_hash: Option<String>,
    pub path_cover_small: Option<String>,
    pub path_cover_large: Option<String>,
    pub url_cover: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub files: Vec<RomFile>,
    #[serde(deserialize_with = "datetime")]
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    pub raw: String,
}

impl Rom {
    /// Parse a ROM, keeping the payload verbatim
    pub fn from_raw(raw: &str) -> serde_json::Result<Self> {
        let mut rom: Rom = serde_json::from_str(raw)?;
        rom.raw = raw.to_string();
        Ok(rom)
    }

    /// Payload to persist: the server's bytes when known, else a re-encoding
    pub fn raw_or_encoded(&self) -> String {
        if self.raw.is_empty() {
            serde_json::to_string(self).unwrap_or_default()
        } else {
            self.raw.clone()
        }
    }

    /// Preferred cover: small, then large, then the external URL
    pub fn cover_path(&self) -> Option<&str> {
        [&self.path_cover_small, &self.path_cover_large, &self.url_cover]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Non-empty hash values
    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        [&self.crc_hash, &self.md5_hash, &self.sha1_hash]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// A page of `/api/roms`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RomPage {
    pub items: Vec<Rom>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Filters for `/api/roms`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RomQuery {
    pub platform_id: Option<i64>,
    pub collection_id: Option<i64>,
    pub smart_collection_id: Option<i64>,
    pub virtual_collection_id: Option<String>,
    pub search: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub order_by: Option<String>,
    pub order_dir: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
}

impl RomQuery {
    pub fn for_platform(platform_id: i64) -> Self {
        Self {
            platform_id: Some(platform_id),
            ..Default::default()
        }
    }

    pub fn page(mut self, offset: i64, limit: i64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn updated_after(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.updated_after = since;
        self
    }

    /// Newest-first, used by the freshness check
    pub fn newest_first(mut self) -> Self {
        self.order_by = Some("updated_at".to_string());
        self.order_dir = Some("desc".to_string());
        self
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.platform_id {
            pairs.push(("platform_id", v.to_string()));
        }
        if let Some(v) = self.collection_id {
            pairs.push(("collection_id", v.to_string()));
        }
        if let Some(v) = self.smart_collection_id {
            pairs.push(("smart_collection_id", v.to_string()));
        }
        if let Some(v) = &self.virtual_collection_id {
            pairs.push(("virtual_collection_id", v.clone()));
        }
        if let Some(v) = &self.search {
            pairs.push(("search", v.clone()));
        }
        if let Some(v) = self.offset {
            pairs.push(("offset", v.to_string()));
        }
        if let Some(v) = self.limit {
            pairs.push(("limit", v.to_string()));
        }
        if let Some(v) = &self.order_by {
            pairs.push(("order_by", v.clone()));
        }
        if let Some(v) = &self.order_dir {
            pairs.push(("order_dir", v.clone()));
        }
        if let Some(v) = self.updated_after {
            pairs.push(("updated_after", v.to_rfc3339()));
        }
        pairs
    }
}

/// Hash used by `/api/roms/by-hash`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RomHash {
    Crc(String),
    Md5(String),
    Sha1(String),
}

impl RomHash {
    pub fn to_pair(&self) -> (&'static str, &str) {
        match self {
            RomHash::Crc(v) => ("crc_hash", v),
            RomHash::Md5(v) => ("md5_hash", v),
            RomHash::Sha1(v) => ("sha1_hash", v),
        }
    }
}

/// Collection flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CollectionKind {
    Regular,
    Smart,
    Virtual,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Regular,
        CollectionKind::Smart,
        CollectionKind::Virtual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Regular => "regular",
            CollectionKind::Smart => "smart",
            CollectionKind::Virtual => "virtual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "regular" => Some(CollectionKind::Regular),
            "smart" => Some(CollectionKind::Smart),
            "virtual" => Some(CollectionKind::Virtual),
            _ => None,
        }
    }

    /// API path listing collections of this kind
    pub fn endpoint(&self) -> &'static str {
        match self {
            CollectionKind::Regular => "/api/collections",
            CollectionKind::Smart => "/api/collections/smart",
            CollectionKind::Virtual => "/api/collections/virtual",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a collection; virtual collections are keyed by string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionId {
    Regular(i64),
    Smart(i64),
    Virtual(String),
}

impl CollectionId {
    pub fn kind(&self) -> CollectionKind {
        match self {
            CollectionId::Regular(_) => CollectionKind::Regular,
            CollectionId::Smart(_) => CollectionKind::Smart,
            CollectionId::Virtual(_) => CollectionKind::Virtual,
        }
    }

    /// Integer id for regular and smart collections
    pub fn romm_id(&self) -> Option<i64> {
        match self {
            CollectionId::Regular(id) | CollectionId::Smart(id) => Some(*id),
            CollectionId::Virtual(_) => None,
        }
    }

    /// String id for virtual collections
    pub fn virtual_id(&self) -> Option<&str> {
        match self {
            CollectionId::Virtual(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionId::Regular(id) | CollectionId::Smart(id) => {
                write!(f, "{}:{}", self.kind(), id)
            }
            CollectionId::Virtual(id) => write!(f, "virtual:{}", id),
        }
    }
}

/// A regular, smart or virtual collection
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub rom_count: i64,
    pub rom_ids: Vec<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub raw: String,
}

#[derive(Deserialize)]
struct CollectionPayload {
    id: serde_json::Value,
    #[serde(default, deserialize_with = "null_default")]
    name: String,
    #[serde(default, deserialize_with = "null_default")]
    rom_count: i64,
    #[serde(default, deserialize_with = "null_default")]
    rom_ids: Vec<i64>,
    #[serde(default, deserialize_with = "optional_datetime")]
    updated_at: Option<DateTime<Utc>>,
}

impl Collection {
    /// Parse a collection payload of the given kind, keeping it verbatim
    pub fn from_raw(kind: CollectionKind, raw: &str) -> serde_json::Result<Self> {
        use serde::de::Error;

        let payload: CollectionPayload = serde_json::from_str(raw)?;
        let id = match (kind, &payload.id) {
            (CollectionKind::Virtual, serde_json::Value::String(s)) => CollectionId::Virtual(s.clone()),
            (CollectionKind::Virtual, serde_json::Value::Number(n)) => {
                CollectionId::Virtual(n.to_string())
            }
            (CollectionKind::Regular, serde_json::Value::Number(n)) => CollectionId::Regular(
                n.as_i64()
                    .ok_or_else(|| serde_json::Error::custom("collection id out of range"))?,
            ),
            (CollectionKind::Smart, serde_json::Value::Number(n)) => CollectionId::Smart(
                n.as_i64()
                    .ok_or_else(|| serde_json::Error::custom("collection id out of range"))?,
            ),
            (kind, other) => {
                return Err(serde_json::Error::custom(format!(
                    "unexpected {} collection id: {}",
                    kind, other
                )));
            }
        };

        let rom_count = if payload.rom_count == 0 {
            payload.rom_ids.len() as i64
        } else {
            payload.rom_count
        };

        Ok(Self {
            id,
            name: payload.name,
            rom_count,
            rom_ids: payload.rom_ids,
            updated_at: payload.updated_at,
            raw: raw.to_string(),
        })
    }

    pub fn kind(&self) -> CollectionKind {
        self.id.kind()
    }
}

/// BIOS / firmware file available for a platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Firmware {
    pub id: i64,
    #[serde(deserialize_with = "null_default")]
    pub file_name: String,
    #[serde(deserialize_with = "null_default")]
    pub file_path: String,
    #[serde(deserialize_with = "null_default")]
    pub file_size_bytes: u64,
    pub md5_hash: Option<String>,
}

impl Firmware {
    /// Name to install the file under.
    ///
    /// Some servers return an empty `file_path`; the bare file name is used
    /// then.
    pub fn install_name(&self) -> &str {
        let path = self.file_path.trim().trim_end_matches('/');
        if path.is_empty() {
            return &self.file_name;
        }
        let last = path.rsplit('/').next().unwrap_or(path);
        // file_path usually names the containing folder, not the file
        if last == self.file_name || last.contains('.') {
            last
        } else {
            &self.file_name
        }
    }
}

/// A remote save file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Save {
    pub id: i64,
    pub rom_id: i64,
    #[serde(deserialize_with = "null_default")]
    pub file_name: String,
    #[serde(deserialize_with = "null_default")]
    pub file_name_no_ext: String,
    #[serde(deserialize_with = "null_default")]
    pub file_extension: String,
    pub emulator: Option<String>,
    pub download_path: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub file_size_bytes: u64,
    #[serde(deserialize_with = "datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Save {
    /// Extension without the leading dot, derived from the name if needed
    pub fn extension(&self) -> &str {
        let ext = self.file_extension.trim_start_matches('.');
        if !ext.is_empty() {
            return ext;
        }
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or_default()
    }
}

/// Filters for `/api/saves`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveQuery {
    pub rom_id: Option<i64>,
    pub emulator: Option<String>,
    pub platform_id: Option<i64>,
}

impl SaveQuery {
    pub fn for_platform(platform_id: i64) -> Self {
        Self {
            platform_id: Some(platform_id),
            ..Default::default()
        }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = self.rom_id {
            pairs.push(("rom_id", v.to_string()));
        }
        if let Some(v) = &self.emulator {
            pairs.push(("emulator", v.clone()));
        }
        if let Some(v) = self.platform_id {
            pairs.push(("platform_id", v.to_string()));
        }
        pairs
    }
}

/// `/api/heartbeat` response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "SYSTEM", default)]
    pub system: HeartbeatSystem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HeartbeatSystem {
    #[serde(rename = "VERSION", default, deserialize_with = "null_default")]
    pub version: String,
}

impl Heartbeat {
    pub fn version(&self) -> &str {
        &self.system.version
    }
}

/// Server fs_slug to CFW folder remapping from `/api/config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PlatformBinding {
    #[serde(rename = "PLATFORMS_BINDING", alias = "platforms_binding", default)]
    pub bindings: HashMap<String, String>,
}

impl PlatformBinding {
    /// CFW folder for a server slug (identity when unbound)
    pub fn to_cfw<'a>(&'a self, romm_slug: &'a str) -> &'a str {
        self.bindings
            .get(romm_slug)
            .map(String::as_str)
            .unwrap_or(romm_slug)
    }

    /// Server slug for a CFW folder (identity when unbound)
    pub fn to_romm<'a>(&'a self, cfw_slug: &'a str) -> &'a str {
        self.bindings
            .iter()
            .find(|(_, cfw)| cfw.as_str() == cfw_slug)
            .map(|(romm, _)| romm.as_str())
            .unwrap_or(cfw_slug)
    }
}

/// Body of `POST /api/devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRegistration {
    pub name: String,
    pub platform: String,
    pub client: String,
    pub client_version: String,
}

/// A registered device
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// RFC 3339, or a naive timestamp taken as UTC
pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn optional_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_datetime(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}"))),
    }
}

fn datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(optional_datetime(deserializer)?.unwrap_or_default())
}
