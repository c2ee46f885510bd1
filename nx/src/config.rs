//! Configuration types, loading and validation
//!
//! A YAML file (if one is found) is layered under environment overrides, then
//! [`Config::validate`] turns it into the immutable [`DeployConfig`] the
//! engine runs with.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::deploy::{FlakeSource, RebuildCommand};
use crate::notifier::{DEFAULT_BUFFER, MatrixConfig};
use crate::repo::{RepoError, RepositoryIdentity};
use crate::transport::SshOptions;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "APP_CONFIG";

const CONFIG_FILE_NAME: &str = "nxcd.yml";

/// Key used when none is configured: the host's own SSH key
pub const DEFAULT_PRIVATE_KEY: &str = "/etc/ssh/ssh_host_ed25519_key";

/// Configuration problems detected before the engine starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing nix host name (target) for the flake")]
    MissingTarget,

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("missing git repo in the format owner/name")]
    MissingRepo,

    #[error("missing SSH private key path")]
    MissingKeys,

    #[error("poll interval must be at least one second")]
    InvalidPollInterval,

    #[error("missing rebuild program")]
    MissingRebuildProgram,

    #[error("matrix notifications enabled but missing: {}", .0.join(", "))]
    IncompleteMatrix(Vec<&'static str>),
}

/// Top-level configuration as read from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attribute of `nixosConfigurations` to switch to
    pub target: String,

    /// Seconds between polls
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// How long shutdown waits for an in-flight rebuild
    #[serde(rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    pub git: GitConfig,

    pub rebuild: RebuildConfig,

    pub matrix: MatrixConfig,

    pub notify: NotifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: String::new(),
            poll_interval_secs: 60,
            shutdown_timeout_secs: 600,
            log_level: None,
            git: GitConfig::default(),
            rebuild: RebuildConfig::default(),
            matrix: MatrixConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

/// Remote repository and SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// `owner/name`
    pub repo: String,

    pub branch: String,

    pub host: String,

    pub user: String,

    pub port: u16,

    /// Flake URL scheme for the rebuild locator
    pub scheme: String,

    #[serde(rename = "private-key-paths")]
    pub private_key_paths: Vec<PathBuf>,

    #[serde(rename = "ssh-program")]
    pub ssh_program: String,

    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo: String::new(),
            branch: "main".to_string(),
            host: "github.com".to_string(),
            user: "git".to_string(),
            port: 22,
            scheme: "git+ssh".to_string(),
            private_key_paths: vec![PathBuf::from(DEFAULT_PRIVATE_KEY)],
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl GitConfig {
    /// SSH client settings for reaching the git host
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            program: self.ssh_program.clone(),
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            identities: self.private_key_paths.clone(),
        }
    }
}

/// Rebuild command; the flake locator is appended to `args`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            program: "nixos-rebuild".to_string(),
            args: vec!["switch".to_string(), "--flake".to_string()],
        }
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Undelivered messages kept before new ones are dropped
    pub buffer: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { buffer: DEFAULT_BUFFER }
    }
}

/// Validated settings consumed by the engine
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub repo: RepositoryIdentity,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub ssh: SshOptions,
    pub flake: FlakeSource,
    pub rebuild_program: String,
    pub rebuild_args: Vec<String>,
    pub matrix: Option<MatrixConfig>,
    pub notify_buffer: usize,
}

impl DeployConfig {
    pub fn rebuild_command(&self) -> RebuildCommand {
        RebuildCommand::new(self.rebuild_program.clone(), self.rebuild_args.clone(), self.flake.clone())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Explicit path, then `app_config`, then the first `nxcd.yml` that exists
/// in `search_dirs`
///
/// Explicit and `app_config` paths are returned even if missing so loading
/// reports the error.
fn find_config_file(
    config_path: Option<&PathBuf>,
    app_config: Option<String>,
    search_dirs: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(path) = config_path {
        return Some(path.clone());
    }
    if let Some(path) = non_empty(app_config) {
        return Some(PathBuf::from(path));
    }
    search_dirs
        .iter()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|path| path.exists())
}

fn read_log_level(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let config: Config = serde_yaml::from_str(&content).ok()?;
    config.log_level
}

impl Config {
    /// Load configuration with fallback chain, then apply environment overrides
    ///
    /// Order: explicit path, `$APP_CONFIG`, `./nxcd.yml`,
    /// `<config dir>/nxcd/nxcd.yml`, built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file(config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file(config_path: Option<&PathBuf>) -> Result<Self> {
        match Self::config_file(config_path) {
            Some(path) => {
                Self::load_from_file(&path).context(format!("Failed to load config from {}", path.display()))
            }
            None => {
                info!("No config file found, using defaults and environment");
                Ok(Self::default())
            }
        }
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// The config file [`Config::load`] would read, if any
    pub fn config_file(config_path: Option<&PathBuf>) -> Option<PathBuf> {
        let mut search_dirs = vec![PathBuf::from(".")];
        if let Some(config_dir) = dirs::config_dir() {
            search_dirs.push(config_dir.join("nxcd"));
        }
        find_config_file(config_path, std::env::var(CONFIG_ENV).ok(), &search_dirs)
    }

    /// Read just the log level, ignoring any error
    ///
    /// Used before logging is set up, so failures stay silent here and
    /// surface later from [`Config::load`].
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        read_log_level(&Self::config_file(config_path)?)
    }

    /// Override fields from environment variables that are set and non-empty
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(v) = get("NIX_HOST") {
            self.target = v;
        }
        if let Some(v) = get("GIT_REPO") {
            self.git.repo = v;
        }
        if let Some(v) = get("GIT_BRANCH") {
            self.git.branch = v;
        }
        if let Some(v) = get("GIT_SSH_PRIVATE_KEY_PATH") {
            self.git.private_key_paths = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(v) = get("POLL_DURATION") {
            match v.parse::<u64>() {
                Ok(secs) => self.poll_interval_secs = secs,
                Err(e) => warn!(value = %v, error = %e, "Ignoring invalid POLL_DURATION"),
            }
        }
        if let Some(v) = get("MATRIX_ENABLED") {
            self.matrix.enabled = v == "true";
        }
        if let Some(v) = get("MATRIX_HOMESERVER") {
            self.matrix.home_server = v;
        }
        if let Some(v) = get("MATRIX_USERNAME") {
            self.matrix.username = v;
        }
        if let Some(v) = get("MATRIX_PASSWORD") {
            self.matrix.password = v;
        }
        if let Some(v) = get("MATRIX_ROOMID") {
            self.matrix.room_id = v;
        }
    }

    /// Check required settings and build the engine's [`DeployConfig`]
    pub fn validate(&self) -> Result<DeployConfig, ConfigError> {
        debug!("Config::validate: called");
        if self.target.trim().is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        if self.git.repo.trim().is_empty() {
            return Err(ConfigError::MissingRepo);
        }
        let repo = RepositoryIdentity::new(self.git.repo.trim(), self.git.branch.trim())?;

        if self.git.private_key_paths.is_empty() {
            return Err(ConfigError::MissingKeys);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.rebuild.program.trim().is_empty() {
            return Err(ConfigError::MissingRebuildProgram);
        }

        let matrix = if self.matrix.enabled {
            let missing = self.matrix.missing_fields();
            if !missing.is_empty() {
                return Err(ConfigError::IncompleteMatrix(missing));
            }
            Some(self.matrix.clone())
        } else {
            None
        };

        Ok(DeployConfig {
            repo,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            ssh: self.git.ssh_options(),
            flake: FlakeSource {
                scheme: self.git.scheme.clone(),
                user: self.git.user.clone(),
                host: self.git.host.clone(),
                target: self.target.trim().to_string(),
            },
            rebuild_program: self.rebuild.program.clone(),
            rebuild_args: self.rebuild.args.clone(),
            matrix,
            notify_buffer: self.notify.buffer.max(1),
        })
    }
}
