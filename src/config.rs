use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_RESPAWN_DELAY_MS: u64 = 1000;

/// Optional settings file, loaded from TOML. Command-line flags override it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlotillaConfig {
    pub hub: Option<HubSection>,
    pub drone: Option<DroneSection>,
}

/// `[hub]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSection {
    pub port: Option<u16>,
    pub git_port: Option<u16>,
    pub secret: Option<String>,
    pub basedir: Option<PathBuf>,
    /// Override the system hostname.
    pub hostname: Option<String>,
}

/// `[drone]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneSection {
    /// Hub control address (host:port).
    pub hub: Option<String>,
    pub secret: Option<String>,
    pub basedir: Option<PathBuf>,
    pub identity: Option<String>,
    pub hostname: Option<String>,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
}

impl Default for DroneSection {
    fn default() -> Self {
        Self {
            hub: None,
            secret: None,
            basedir: None,
            identity: None,
            hostname: None,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            scrollback_bytes: crate::drone::DEFAULT_SCROLLBACK_BYTES,
        }
    }
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

fn default_respawn_delay_ms() -> u64 {
    DEFAULT_RESPAWN_DELAY_MS
}

fn default_scrollback_bytes() -> usize {
    crate::drone::DEFAULT_SCROLLBACK_BYTES
}

impl FlotillaConfig {
    /// Load config from a TOML file.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn hub(&self) -> HubSection {
        self.hub.clone().unwrap_or_default()
    }

    pub fn drone(&self) -> DroneSection {
        self.drone.clone().unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, toml::de::Error),
}

/// Warn if a config file is world-readable; it may hold the shared secret.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}). \
             It may contain the fleet secret -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// The configured hostname, or the system's.
pub fn resolve_hostname(configured: Option<&str>) -> String {
    if let Some(hostname) = configured {
        return hostname.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
