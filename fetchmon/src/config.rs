//! Configuration for the download coordinator.
//!
//! [`CoordinatorConfig`] is the in-memory configuration handed to
//! [`DownloadCoordinator::new`](crate::download::DownloadCoordinator::new).
//! [`ConfigFile`] is its persisted form, an INI file:
//!
//! ```ini
//! [downloads]
//! directory = /home/user/Downloads
//! max_active = 4
//! chunk_size = 65536
//! exists_policy = resume
//!
//! [network]
//! timeout_secs = 30
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::download::ExistsPolicy;

/// Default number of concurrently active downloads.
pub const DEFAULT_MAX_ACTIVE: usize = 4;

/// Default number of bytes fetched per loop iteration.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Directory name under the platform config directory.
pub const APP_DIR_NAME: &str = "fetchmon";

const SECTION_DOWNLOADS: &str = "downloads";
const SECTION_NETWORK: &str = "network";

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No platform configuration directory could be determined.
    #[error("could not determine the configuration directory")]
    NoConfigDir,

    /// The file exists but could not be read or parsed.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    /// The file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No setting is known under this name.
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),

    /// A key holds a value of the wrong shape.
    #[error("invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of a [`DownloadCoordinator`](crate::download::DownloadCoordinator).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Directory new downloads are written to when no path is given.
    pub download_dir: PathBuf,

    /// Maximum number of downloads in the active set.
    pub max_active: usize,

    /// Upper bound on bytes fetched per loop iteration.
    ///
    /// Pause and stop take effect between chunks, so this also bounds how
    /// long a halt request can take to be honoured.
    pub chunk_size: usize,

    /// What the first run does when the destination already exists.
    pub exists_policy: ExistsPolicy,

    /// HTTP client timeout.
    pub timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_active: DEFAULT_MAX_ACTIVE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exists_policy: ExistsPolicy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration writing into `download_dir`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            ..Default::default()
        }
    }

    /// Set the download directory.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Set the active-set capacity. Values below 1 are raised to 1.
    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max.max(1);
        self
    }

    /// Set the chunk size. Values below 1 are raised to 1.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Set the exists policy.
    pub fn with_exists_policy(mut self, policy: ExistsPolicy) -> Self {
        self.exists_policy = policy;
        self
    }

    /// Set the HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Platform download directory, or the working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Persisted configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub download_dir: PathBuf,
    pub max_active: usize,
    pub chunk_size: usize,
    pub exists_policy: ExistsPolicy,
    pub timeout_secs: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for ConfigFile {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            download_dir: config.download_dir.clone(),
            max_active: config.max_active,
            chunk_size: config.chunk_size,
            exists_policy: config.exists_policy,
            timeout_secs: config.timeout.as_secs(),
        }
    }
}

impl From<&ConfigFile> for CoordinatorConfig {
    fn from(file: &ConfigFile) -> Self {
        CoordinatorConfig::new(file.download_dir.clone())
            .with_max_active(file.max_active)
            .with_chunk_size(file.chunk_size)
            .with_exists_policy(file.exists_policy)
            .with_timeout(Duration::from_secs(file.timeout_secs))
    }
}

impl ConfigFile {
    /// Default location: `<config dir>/fetchmon/config.ini`.
    pub fn default_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME).join("config.ini"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`. A missing file yields the defaults; missing keys
    /// keep their default values.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Load from the default location.
    pub fn load_default() -> ConfigResult<Self> {
        Self::load(&Self::default_path()?)
    }

    /// Parse an already loaded INI document.
    pub fn from_ini(ini: &Ini) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some(SECTION_DOWNLOADS)) {
            if let Some(dir) = section.get("directory").filter(|v| !v.trim().is_empty()) {
                config.download_dir = expand_tilde(dir.trim());
            }
            if let Some(v) = section.get("max_active") {
                config.max_active = parse_positive(SECTION_DOWNLOADS, "max_active", v)?;
            }
            if let Some(v) = section.get("chunk_size") {
                config.chunk_size = parse_positive(SECTION_DOWNLOADS, "chunk_size", v)?;
            }
            if let Some(v) = section.get("exists_policy") {
                config.exists_policy =
                    v.parse().map_err(|reason| ConfigError::InvalidValue {
                        section: SECTION_DOWNLOADS,
                        key: "exists_policy",
                        value: v.to_string(),
                        reason,
                    })?;
            }
        }

        if let Some(section) = ini.section(Some(SECTION_NETWORK)) {
            if let Some(v) = section.get("timeout_secs") {
                config.timeout_secs =
                    parse_positive(SECTION_NETWORK, "timeout_secs", v)? as u64;
            }
        }

        Ok(config)
    }

    /// Render as an INI document.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some(SECTION_DOWNLOADS))
            .set("directory", self.download_dir.to_string_lossy())
            .set("max_active", self.max_active.to_string())
            .set("chunk_size", self.chunk_size.to_string())
            .set("exists_policy", self.exists_policy.as_str());
        ini.with_section(Some(SECTION_NETWORK))
            .set("timeout_secs", self.timeout_secs.to_string());
        ini
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        self.to_ini()
            .write_to_file(path)
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Convert into the runtime configuration.
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::from(self)
    }
}

/// Addressable setting of the configuration file, named `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    DownloadsDirectory,
    DownloadsMaxActive,
    DownloadsChunkSize,
    DownloadsExistsPolicy,
    NetworkTimeoutSecs,
}

impl ConfigKey {
    /// Every key, in file order.
    pub fn all() -> &'static [ConfigKey] {
        &[
            ConfigKey::DownloadsDirectory,
            ConfigKey::DownloadsMaxActive,
            ConfigKey::DownloadsChunkSize,
            ConfigKey::DownloadsExistsPolicy,
            ConfigKey::NetworkTimeoutSecs,
        ]
    }

    pub fn section(&self) -> &'static str {
        match self {
            ConfigKey::NetworkTimeoutSecs => SECTION_NETWORK,
            _ => SECTION_DOWNLOADS,
        }
    }

    pub fn key_name(&self) -> &'static str {
        match self {
            ConfigKey::DownloadsDirectory => "directory",
            ConfigKey::DownloadsMaxActive => "max_active",
            ConfigKey::DownloadsChunkSize => "chunk_size",
            ConfigKey::DownloadsExistsPolicy => "exists_policy",
            ConfigKey::NetworkTimeoutSecs => "timeout_secs",
        }
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value rendered as it would appear in the file.
    pub fn get(&self, config: &ConfigFile) -> String {
        match self {
            ConfigKey::DownloadsDirectory => config.download_dir.display().to_string(),
            ConfigKey::DownloadsMaxActive => config.max_active.to_string(),
            ConfigKey::DownloadsChunkSize => config.chunk_size.to_string(),
            ConfigKey::DownloadsExistsPolicy => config.exists_policy.to_string(),
            ConfigKey::NetworkTimeoutSecs => config.timeout_secs.to_string(),
        }
    }

    /// Parse and store `value`.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> ConfigResult<()> {
        let section = self.section();
        let key = self.key_name();
        match self {
            ConfigKey::DownloadsDirectory => {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        section,
                        key,
                        value: value.to_string(),
                        reason: "must not be empty".to_string(),
                    });
                }
                config.download_dir = expand_tilde(value.trim());
            }
            ConfigKey::DownloadsMaxActive => {
                config.max_active = parse_positive(section, key, value)?;
            }
            ConfigKey::DownloadsChunkSize => {
                config.chunk_size = parse_positive(section, key, value)?;
            }
            ConfigKey::DownloadsExistsPolicy => {
                config.exists_policy =
                    value.parse().map_err(|reason| ConfigError::InvalidValue {
                        section,
                        key,
                        value: value.to_string(),
                        reason,
                    })?;
            }
            ConfigKey::NetworkTimeoutSecs => {
                config.timeout_secs = parse_positive(section, key, value)? as u64;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section(), self.key_name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

fn parse_positive(section: &'static str, key: &'static str, value: &str) -> ConfigResult<usize> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        section,
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match value.trim().parse::<usize>() {
        Ok(0) => Err(invalid("must be at least 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid("not a number")),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
