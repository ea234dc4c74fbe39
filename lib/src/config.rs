//! Server configuration.
//!
//! Settings come from a TOML file (`server.toml`) merged with
//! `CADENZA_`-prefixed environment variables, so every key is
//! environment-overridable (`CADENZA_COM__PORT=9000`,
//! `CADENZA_AUTH__JWT_SECRET=...`). Missing file means defaults, which are
//! also written back so a fresh deployment has something to edit.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The filename of the server config.
pub const FILE_NAME: &str = "server.toml";

/// Environment prefix for overrides; nested keys split on `__`.
const ENV_PREFIX: &str = "CADENZA_";

pub type SharedServerSettings = Arc<RwLock<ServerSettings>>;

#[must_use]
pub fn new_shared_server_settings(settings: ServerSettings) -> SharedServerSettings {
    Arc::new(RwLock::new(settings))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)] // allow missing fields and fill them with the `..Self::default()` in this struct
pub struct ServerSettings {
    pub com: ComSettings,
    pub player: PlayerSettings,
    pub auth: AuthSettings,
    pub store: StoreSettings,
    pub search: SearchSettings,
    pub download: DownloadSettings,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComSettings {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for ComSettings {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8086,
        }
    }
}

impl From<&ComSettings> for SocketAddr {
    fn from(settings: &ComSettings) -> Self {
        Self::new(settings.ip, settings.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlayerSettings {
    /// Cadence of the periodic state broadcast, in milliseconds.
    pub state_tick_ms: NonZeroU64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            // realistically, anything under a second is just socket noise
            state_tick_ms: NonZeroU64::new(1000).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AuthSettings {
    /// Shared secret the auth service signs control-socket JWTs with.
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StoreSettings {
    /// Credentials file for the external content store.
    pub credentials_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SearchSettings {
    /// Credentials file for the external video-search API.
    pub credentials_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadSettings {
    /// Directory downloaded media lands in; erased at startup.
    pub output_dir: PathBuf,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("songs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewaySettings {
    /// Base WebSocket URL of the gateway daemon that owns the Discord side.
    pub url: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: String::from("ws://127.0.0.1:8087"),
        }
    }
}

impl ServerSettings {
    /// Read the config from `path`, merged with environment overrides.
    ///
    /// A missing file is not an error: defaults are saved there first.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.save_file(path)?;
        }

        let settings = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("parse config {}", path.display()))?;

        Ok(settings)
    }

    /// Write the settings as TOML to `path`, creating parent directories.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }

        let data = toml::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, data).with_context(|| format!("write config {}", path.display()))?;

        Ok(())
    }
}
