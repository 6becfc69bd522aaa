//! Configuration file support for abflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ABFLASH_*)
//! 3. Local config file (./abflash.toml)
//! 4. Global config file (~/.config/abflash/config.toml)
//!
//! ```toml
//! [console]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [image]
//! host = "192.168.1.10"
//! user = "root"
//! base_path = "/srv/images"
//!
//! [relay]
//! local = true
//!
//! [timeouts]
//! transfer = 900
//!
//! [reboot]
//! max_wait = 180
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use abflash::{FlashOptions, RebootPolicy};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::CliError;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG_FILE: &str = "abflash.toml";

/// Device console settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Serial port of the device console.
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Shell prompt regexes, replacing the built-in `user@host:path# ` pattern.
    #[serde(default)]
    pub prompts: Vec<String>,
}

/// Image host settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Host serving the images over SSH.
    pub host: Option<String>,
    /// Login on the image host.
    pub user: Option<String>,
    /// Directory relative image paths are resolved against.
    pub base_path: Option<String>,
}

/// Relay settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Use `ssh` on this machine as relay.
    #[serde(default)]
    pub local: bool,
    /// Serial port of a second machine used as relay.
    pub port: Option<String>,
    /// `ConnectTimeout` passed to ssh on the relay, in seconds.
    pub connect_timeout: Option<u64>,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Inspection commands on the device.
    pub command: Option<u64>,
    /// Commands on the image host.
    pub ssh: Option<u64>,
    /// The image transfer.
    pub transfer: Option<u64>,
}

/// Reboot wait in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebootConfig {
    /// Give up after this long.
    pub max_wait: Option<u64>,
    /// Time between liveness probes.
    pub poll_interval: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device console.
    #[serde(default)]
    pub console: ConsoleConfig,
    /// Image host.
    #[serde(default)]
    pub image: ImageConfig,
    /// Relay.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Reboot wait.
    #[serde(default)]
    pub reboot: RebootConfig,
}

impl Config {
    /// Load configuration from the global and local config files.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            match Self::load_from_file(&global_path) {
                Ok(Some(global)) => {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global);
                },
                Ok(None) => {},
                Err(e) => warn!("{e}"),
            }
        }

        match Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            Ok(Some(local)) => {
                debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
                config.merge(local);
            },
            Ok(None) => {},
            Err(e) => warn!("{e}"),
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit files, an explicitly named file must exist and parse.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        match Self::load_from_file(path)? {
            Some(config) => {
                debug!("Loaded config from {}", path.display());
                Ok(config)
            },
            None => Err(CliError::Config(format!(
                "Config file {} does not exist",
                path.display()
            ))
            .into()),
        }
    }

    /// Read and parse `path`; `Ok(None)` if it does not exist.
    fn load_from_file(path: &Path) -> Result<Option<Self>, CliError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map(Some).map_err(|e| {
            CliError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "abflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.console.port, other.console.port);
        take(&mut self.console.baud, other.console.baud);
        if !other.console.prompts.is_empty() {
            self.console.prompts = other.console.prompts;
        }

        take(&mut self.image.host, other.image.host);
        take(&mut self.image.user, other.image.user);
        take(&mut self.image.base_path, other.image.base_path);

        self.relay.local |= other.relay.local;
        take(&mut self.relay.port, other.relay.port);
        take(&mut self.relay.connect_timeout, other.relay.connect_timeout);

        take(&mut self.timeouts.command, other.timeouts.command);
        take(&mut self.timeouts.ssh, other.timeouts.ssh);
        take(&mut self.timeouts.transfer, other.timeouts.transfer);

        take(&mut self.reboot.max_wait, other.reboot.max_wait);
        take(&mut self.reboot.poll_interval, other.reboot.poll_interval);
    }

    /// Flash options with the configured values applied over the defaults.
    pub fn flash_options(&self) -> FlashOptions {
        let defaults = FlashOptions::default();
        let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);

        let policy = RebootPolicy::default();
        let reboot = RebootPolicy {
            max_wait: secs(self.reboot.max_wait, policy.max_wait),
            poll_interval: secs(self.reboot.poll_interval, policy.poll_interval),
            ..policy
        };

        FlashOptions {
            command_timeout: secs(self.timeouts.command, defaults.command_timeout),
            ssh_timeout: secs(self.timeouts.ssh, defaults.ssh_timeout),
            transfer_timeout: secs(self.timeouts.transfer, defaults.transfer_timeout),
            reboot,
            ..defaults
        }
    }
}
