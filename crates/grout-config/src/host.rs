//! RomM server connection settings

use serde::{Deserialize, Serialize};

/// A configured RomM server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub display_name: String,
    pub root_uri: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
}

impl Host {
    /// Root URI with the optional port applied, without a trailing slash
    pub fn base_url(&self) -> String {
        let root = self.root_uri.trim().trim_end_matches('/');

        match self.port {
            Some(port) if port != 0 && !Self::has_explicit_port(root) => {
                format!("{}:{}", root, port)
            }
            _ => root.to_string(),
        }
    }

    /// URL scheme of the root URI (`http` when none is given)
    pub fn scheme(&self) -> &str {
        self.root_uri
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or("http")
    }

    /// Stable identity used to tie a local cache to this server and user
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.base_url())
    }

    fn has_explicit_port(root: &str) -> bool {
        let authority = root.split_once("://").map(|(_, rest)| rest).unwrap_or(root);
        let authority = authority.split('/').next().unwrap_or(authority);
        authority
            .rsplit_once(':')
            .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
    }
}
