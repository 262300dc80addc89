use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbbk/config.toml";
const DEFAULT_BACKUP_DIRECTORY: &str = "/var/lib/usbbk/backups";
const ENV_PREFIX: &str = "USBBK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root under which every `usb_backup_<timestamp>` directory is created.
    pub backup_directory: PathBuf,
    /// How long to keep re-checking for a mount after an add event.
    /// Zero means a single check.
    pub mount_wait_secs: u64,
    /// fsync every copied file before moving on.
    pub sync_files: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub simulation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from(DEFAULT_BACKUP_DIRECTORY),
            mount_wait_secs: 0,
            sync_files: true,
            verbose: false,
            json_logs: false,
            simulation: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, the config file, `USBBK_*` env vars
    /// and finally CLI arguments (highest priority).
    ///
    /// The config file path can be overridden with `USBBK_CONFIG`.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let config_path = std::env::var_os("USBBK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let env = Env::prefixed(ENV_PREFIX).ignore(&["config"]);
        Self::load(&config_path, Some(env), cli_args)
    }

    fn load<T: Serialize>(
        config_path: &Path,
        env: Option<Env>,
        cli_args: Option<&T>,
    ) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_path));

        if let Some(env) = env {
            figment = figment.merge(env);
        }
        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration ({})", config_path.display()))
    }

    pub fn mount_wait(&self) -> Duration {
        Duration::from_secs(self.mount_wait_secs)
    }
}
