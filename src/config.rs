use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerProfile {
    pub url: String,
}

/// Saved server profiles, read from `config.json`:
///
/// ```json
/// { "default_server": "home",
///   "servers": { "home": { "url": "http://speed.lan:8080/" } } }
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,
    #[serde(default)]
    pub default_server: Option<String>,
}

/// A server URL ready for endpoint joins, and the profile it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedServer {
    pub url: Url,
    pub profile: Option<String>,
}

/// `$XDG_CONFIG_HOME/qospeedtest/config.json`, or under `~/.config`.
pub fn config_path() -> Option<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("qospeedtest").join("config.json"))
}

impl UserConfig {
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// A missing file reads as an empty config.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No user config");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut config: UserConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(name) = &config.default_server {
            if !config.servers.contains_key(name) {
                debug!(default_server = %name, "Ignoring default_server with no matching profile");
                config.default_server = None;
            }
        }
        debug!(path = %path.display(), servers = config.servers.len(), "Loaded user config");
        Ok(config)
    }

    /// Picks the server: a profile name, else a literal URL, else the default profile.
    pub fn resolve_server(&self, requested: Option<&str>) -> Result<ResolvedServer, ConfigError> {
        let (url, profile) = match requested {
            Some(name) => match self.servers.get(name) {
                Some(profile) => (profile.url.as_str(), Some(name.to_string())),
                None => (name, None),
            },
            None => {
                let name = self.default_server.as_deref().ok_or(ConfigError::NoServer)?;
                let profile = self.servers.get(name).ok_or(ConfigError::NoServer)?;
                (profile.url.as_str(), Some(name.to_string()))
            }
        };
        Ok(ResolvedServer {
            url: base_url(url)?,
            profile,
        })
    }
}

/// Parses a server URL and makes sure its path ends in `/`.
pub fn base_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|e| ConfigError::BadUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::BadUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
