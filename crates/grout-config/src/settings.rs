//! User configuration stored in `config.json`

use crate::{ConfigError, Host, duration};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default per-call API timeout (30 minutes)
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default per-call download timeout (60 minutes)
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Main Grout configuration
///
/// Every key is optional; enum fields that are missing, empty or unknown are
/// rewritten to their defaults on load and on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hosts: Vec<Host>,

    /// Server fs_slug -> local ROM folder
    pub directory_mappings: HashMap<String, DirectoryMapping>,

    /// Platform fs_slug -> emulator save subfolder
    pub save_directory_mappings: HashMap<String, String>,

    /// ROM id -> emulator save subfolder
    pub game_save_overrides: HashMap<i64, String>,

    pub download_art: bool,
    pub show_box_art: bool,
    pub unzip_downloads: bool,

    pub show_collections: bool,
    pub show_smart_collections: bool,
    pub show_virtual_collections: bool,

    #[serde(deserialize_with = "lenient")]
    pub downloaded_games: DownloadedGamesMode,

    #[serde(deserialize_with = "lenient")]
    pub collection_view: CollectionView,

    #[serde(deserialize_with = "lenient")]
    pub save_sync_mode: SaveSyncMode,

    #[serde(with = "duration")]
    pub api_timeout: Duration,

    #[serde(with = "duration")]
    pub download_timeout: Duration,

    #[serde(deserialize_with = "lenient")]
    pub log_level: LogLevel,

    pub language: String,

    #[serde(deserialize_with = "lenient")]
    pub release_channel: ReleaseChannel,

    pub kid_mode: bool,

    #[serde(deserialize_with = "lenient")]
    pub art_kind: ArtKind,

    pub platform_order: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            directory_mappings: HashMap::new(),
            save_directory_mappings: HashMap::new(),
            game_save_overrides: HashMap::new(),
            download_art: true,
            show_box_art: true,
            unzip_downloads: true,
            show_collections: true,
            show_smart_collections: false,
            show_virtual_collections: false,
            downloaded_games: DownloadedGamesMode::default(),
            collection_view: CollectionView::default(),
            save_sync_mode: SaveSyncMode::default(),
            api_timeout: DEFAULT_API_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            log_level: LogLevel::default(),
            language: "en".to_string(),
            release_channel: ReleaseChannel::default(),
            kid_mode: false,
            art_kind: ArtKind::default(),
            platform_order: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.normalize();
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => {
                tracing::warn!("No configuration file found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut normalized = self.clone();
        normalized.normalize();
        let contents = serde_json::to_string_pretty(&normalized)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Rewrite empty or zero fields to their defaults
    pub fn normalize(&mut self) {
        if self.language.trim().is_empty() {
            self.language = "en".to_string();
        }
        if self.api_timeout.is_zero() {
            self.api_timeout = DEFAULT_API_TIMEOUT;
        }
        if self.download_timeout.is_zero() {
            self.download_timeout = DEFAULT_DOWNLOAD_TIMEOUT;
        }
    }

    /// Fail unless the configuration can talk to a server
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self
            .hosts
            .first()
            .ok_or_else(|| ConfigError::Invalid("no hosts configured".into()))?;

        if host.root_uri.trim().is_empty() {
            return Err(ConfigError::Invalid("host root_uri is empty".into()));
        }

        Ok(())
    }

    /// The host all network calls go to
    pub fn primary_host(&self) -> Option<&Host> {
        self.hosts.first()
    }
}

/// Local folder a server platform is installed into
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryMapping {
    pub slug: String,
    pub relative_path: String,
}

/// Deserialize an enum from a string, falling back to the default for
/// missing, empty or unrecognized values.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_default())
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? } default $default:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// How already-downloaded games are presented
    DownloadedGamesMode {
        DoNothing => "do_nothing",
        Mark => "mark",
        Filter => "filter",
    } default DoNothing
}

string_enum! {
    /// Collection browsing layout
    CollectionView {
        Platform => "platform",
        Unified => "unified",
    } default Platform
}

string_enum! {
    /// Save synchronization mode
    SaveSyncMode {
        Off => "off",
        Manual => "manual",
    } default Off
}

string_enum! {
    LogLevel {
        Debug => "DEBUG",
        Info => "INFO",
        Error => "ERROR",
    } default Info
}

string_enum! {
    /// Which releases the auto-updater considers
    ReleaseChannel {
        MatchRomm => "match_romm",
        Stable => "stable",
        Beta => "beta",
    } default MatchRomm
}

string_enum! {
    /// Preferred artwork style
    ArtKind {
        Default => "default",
        Box2d => "box2d",
        Box3d => "box3d",
        MixImage => "miximage",
    } default Default
}

impl FromStr for DownloadedGamesMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "do_nothing" => Ok(Self::DoNothing),
            "mark" => Ok(Self::Mark),
            "filter" => Ok(Self::Filter),
            _ => Err(()),
        }
    }
}

impl FromStr for CollectionView {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(Self::Platform),
            "unified" => Ok(Self::Unified),
            _ => Err(()),
        }
    }
}

impl FromStr for SaveSyncMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            // "automatic" was retired; it now means manual
            "manual" | "automatic" => Ok(Self::Manual),
            _ => Err(()),
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "ERROR" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for ReleaseChannel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match_romm" => Ok(Self::MatchRomm),
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            _ => Err(()),
        }
    }
}

impl FromStr for ArtKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "box2d" => Ok(Self::Box2d),
            "box3d" => Ok(Self::Box3d),
            "miximage" => Ok(Self::MixImage),
            _ => Err(()),
        }
    }
}
