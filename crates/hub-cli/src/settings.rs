//! Operator settings loaded from the `[hub]` section of `config/default.toml`.
//!
//! A missing file or section falls back to defaults; a section that fails
//! to parse is logged and ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

/// Settings from the `[hub]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Where users, clients, refresh tokens, consents and key material live.
    pub data_dir: PathBuf,
    /// Directory holding `platform.json`, `groups.json`, `models.json`, `apps.json`.
    pub contents_dir: PathBuf,
    /// User records file, relative to `data_dir`.
    pub users_file: String,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            contents_dir: PathBuf::from("contents"),
            users_file: "users.json".into(),
            log_level: "info".into(),
        }
    }
}

impl HubSettings {
    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join(&self.users_file)
    }
}

/// Load `[hub]` from `path`.
pub fn load_settings(path: &Path) -> HubSettings {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no settings file, using defaults");
            return HubSettings::default();
        }
    };
    parse_settings(&content).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid [hub] settings, using defaults");
        HubSettings::default()
    })
}

fn parse_settings(content: &str) -> Result<HubSettings, toml::de::Error> {
    #[derive(Deserialize, Default)]
    struct File {
        #[serde(default)]
        hub: Option<HubSettings>,
    }
    let file: File = toml::from_str(content)?;
    Ok(file.hub.unwrap_or_default())
}
