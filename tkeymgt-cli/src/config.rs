//! Configuration file support for tkey-mgt.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (TKEY_MGT_*)
//! 3. Local config file (./tkey-mgt.toml)
//! 4. Global config file (~/.config/tkey-mgt/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
    tkeymgt::{CatalogRevision, ProvisionConfig, ResetSync},
};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "tkey-mgt.toml";

/// Device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Whether the port disappears on reset. `false` selects a fixed delay.
    pub expect_close: Option<bool>,
}

/// Timing overrides, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Pause between the port closing and reopening it.
    pub settle_delay_ms: Option<u64>,
    /// How long the port may stay open after a reset.
    pub disconnect_timeout_ms: Option<u64>,
    /// Timeout for ordinary responses. `0` waits indefinitely.
    pub response_timeout_ms: Option<u64>,
    /// How long a verify request may go unanswered.
    pub verify_timeout_ms: Option<u64>,
    /// Delay used instead of waiting for the port to close.
    pub reset_delay_ms: Option<u64>,
}

/// Protocol settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Verifier protocol revision.
    pub catalog: Option<CatalogRevision>,
}

/// Boot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootConfig {
    /// Verifier app binary loaded by `boot`.
    pub verifier: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device selection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Timing overrides.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Boot settings.
    #[serde(default)]
    pub boot: BootConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "tkey-mgt").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.device.port.is_some() {
            self.device.port = other.device.port;
        }
        if other.device.expect_close.is_some() {
            self.device.expect_close = other.device.expect_close;
        }

        let timing = other.timing;
        if timing.settle_delay_ms.is_some() {
            self.timing.settle_delay_ms = timing.settle_delay_ms;
        }
        if timing.disconnect_timeout_ms.is_some() {
            self.timing.disconnect_timeout_ms = timing.disconnect_timeout_ms;
        }
        if timing.response_timeout_ms.is_some() {
            self.timing.response_timeout_ms = timing.response_timeout_ms;
        }
        if timing.verify_timeout_ms.is_some() {
            self.timing.verify_timeout_ms = timing.verify_timeout_ms;
        }
        if timing.reset_delay_ms.is_some() {
            self.timing.reset_delay_ms = timing.reset_delay_ms;
        }

        if other.protocol.catalog.is_some() {
            self.protocol.catalog = other.protocol.catalog;
        }

        if other.boot.verifier.is_some() {
            self.boot.verifier = other.boot.verifier;
        }
    }

    /// Build the library configuration. `no_expect_close` comes from the
    /// command line and overrides the file.
    pub fn provision_config(&self, no_expect_close: bool) -> ProvisionConfig {
        let mut config = ProvisionConfig::default();
        let ms = Duration::from_millis;

        if let Some(v) = self.timing.settle_delay_ms {
            config.settle_delay = ms(v);
        }
        if let Some(v) = self.timing.disconnect_timeout_ms {
            config.disconnect_timeout = ms(v);
        }
        if let Some(v) = self.timing.response_timeout_ms {
            config.response_timeout = (v > 0).then(|| ms(v));
        }
        if let Some(v) = self.timing.verify_timeout_ms {
            config.verify_timeout = ms(v);
        }
        if let Some(v) = self.protocol.catalog {
            config.catalog = v;
        }

        let expect_close = !no_expect_close && self.device.expect_close.unwrap_or(true);
        if !expect_close {
            let delay = self.timing.reset_delay_ms.map_or(config.settle_delay, ms);
            config.reset_sync = ResetSync::FixedDelay(delay);
        }

        config
    }
}
