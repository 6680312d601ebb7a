use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::multiplexer::SessionDefaults;
use crate::player::PlaybackSpeed;
use crate::protocol::Geometry;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws/shell";

/// Top-level client config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub session: SessionConfig,
    pub recording: RecordingConfig,
    pub playback: PlaybackConfig,
}

/// Relay endpoint section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the shell relay.
    pub url: String,
    /// Label for the remote host, stamped on recordings.
    pub machine_label: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            machine_label: None,
        }
    }
}

/// Per-session defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to request from the relay. The relay's default when unset.
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub resize_coalesce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            resize_coalesce_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Where recordings are kept. Defaults to the platform data directory.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub min_tick_ms: u64,
    /// One of 0.5, 1, 2, 4.
    pub speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_tick_ms: 10,
            speed: 1.0,
        }
    }
}

impl Config {
    /// `<config dir>/relayterm/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("relayterm").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        match path {
            Some(path) => Ok(Self::load(&path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.relay.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "relay.url must be a ws:// or wss:// URL, got '{url}'"
            )));
        }
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "session geometry must be non-zero, got {}x{}",
                self.session.cols, self.session.rows
            )));
        }
        if let Some(shell) = &self.session.shell {
            validate_shell_name(shell).map_err(ConfigError::Invalid)?;
        }
        if PlaybackSpeed::from_factor(self.playback.speed).is_none() {
            return Err(ConfigError::Invalid(format!(
                "playback.speed must be one of 0.5, 1, 2, 4, got {}",
                self.playback.speed
            )));
        }
        Ok(())
    }

    pub fn recording_dir(&self) -> PathBuf {
        self.recording.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("relayterm")
                .join("recordings")
        })
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.session.cols, self.session.rows)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.session.resize_coalesce_ms)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_millis(self.playback.min_tick_ms)
    }

    pub fn playback_speed(&self) -> PlaybackSpeed {
        PlaybackSpeed::from_factor(self.playback.speed).unwrap_or_default()
    }

    /// Label for recordings: the configured one, else the relay URL's host.
    pub fn machine_label(&self) -> String {
        if let Some(label) = &self.relay.machine_label {
            return label.clone();
        }
        let rest = self
            .relay
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.relay.url);
        rest.split(|c: char| c == '/' || c == '?').next().unwrap_or(rest).to_string()
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            url: self.relay.url.clone(),
            shell: self.session.shell.clone(),
            geometry: self.geometry(),
            coalesce_window: self.coalesce_window(),
            machine_label: self.machine_label(),
        }
    }
}

/// Validate a shell name. Names must be 1-64 chars: alphanumerics and `-_./`.
pub fn validate_shell_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("shell name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("shell name too long ({} chars, max 64)", name.len()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(format!("shell name contains invalid characters: {name}"));
    }
    Ok(())
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable; the relay URL may embed a
/// token.
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
            "Config file {} is world-readable (mode {:o}). \
             Consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Pure helper; does not touch the filesystem.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
