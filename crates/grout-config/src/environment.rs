//! Process environment: which CFW is running and where its files live

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Supported custom firmwares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cfw {
    MuOS,
    NextUI,
    Knulli,
    Spruce,
    Rocknix,
}

impl Cfw {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cfw::MuOS => "MUOS",
            Cfw::NextUI => "NEXTUI",
            Cfw::Knulli => "KNULLI",
            Cfw::Spruce => "SPRUCE",
            Cfw::Rocknix => "ROCKNIX",
        }
    }

    /// Default SD-card root for this CFW
    pub fn default_base_path(&self) -> PathBuf {
        match self {
            Cfw::MuOS => PathBuf::from("/mnt/union"),
            Cfw::NextUI => PathBuf::from("/mnt/SDCARD"),
            Cfw::Knulli => PathBuf::from("/userdata"),
            Cfw::Spruce => PathBuf::from("/mnt/SDCARD"),
            Cfw::Rocknix => PathBuf::from("/storage"),
        }
    }

    /// Name of the release asset built for this CFW
    pub fn release_asset_name(&self) -> String {
        format!("grout-{}", self.as_str().to_ascii_lowercase())
    }
}

impl fmt::Display for Cfw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cfw {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MUOS" => Ok(Cfw::MuOS),
            "NEXTUI" => Ok(Cfw::NextUI),
            "KNULLI" => Ok(Cfw::Knulli),
            "SPRUCE" => Ok(Cfw::Spruce),
            "ROCKNIX" => Ok(Cfw::Rocknix),
            other => Err(ConfigError::UnknownCfw(other.to_string())),
        }
    }
}

/// Values read from environment variables at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub cfw: Cfw,
    pub base_path: PathBuf,
    pub development: bool,
    pub input_mapping_path: Option<PathBuf>,
}

impl Environment {
    /// Read `CFW`, `BASE_PATH`, `ENVIRONMENT` and `INPUT_MAPPING_PATH`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cfw: Cfw = lookup("CFW")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid("CFW is not set".into()))?
            .parse()?;

        let base_path = lookup("BASE_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| cfw.default_base_path());

        let development = lookup("ENVIRONMENT").is_some_and(|v| v.eq_ignore_ascii_case("DEV"));

        let input_mapping_path = lookup("INPUT_MAPPING_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            cfw,
            base_path,
            development,
            input_mapping_path,
        })
    }
}
