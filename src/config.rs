//! Layered YAML configuration.
//!
//! A site-wide `belay.yaml` next to the executable provides defaults; a
//! `~/.belay.yaml` in the invoking user's home overrides it. A default site
//! file is written on first run so operators have something to edit.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry rounds for the grid backend.
    pub max: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max: 3 }
    }
}

/// Per-verb fallback values used when the CLI flag is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub line: usize,
    /// Concurrent batches; defaults to the machine's core count.
    pub thread: usize,
    pub cpu: i64,
    pub mem: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            line: 1,
            thread: num_cpus::get().max(1),
            cpu: 1,
            mem: 1.0,
        }
    }
}

/// Application configuration, merged from the site file and the user file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the shared global ledger database.
    pub db: PathBuf,

    /// Default project name.
    pub project: String,

    pub retry: RetryConfig,

    /// Default queue list for grid submission (comma-separated).
    pub queue: String,

    /// Hosts allowed to submit grid jobs. Empty means any host.
    pub node: Vec<String>,

    /// SGE project passed as `-P` when set.
    pub sge_project: String,

    /// Path of the grid engine's `settings.sh`. Sourced before the first
    /// submission; fatal if unusable in grid mode.
    pub settings: PathBuf,

    /// Seconds between global-ledger upserts from the monitor.
    pub monitor_update_interval: u64,

    pub defaults: DefaultsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: default_global_db_path(),
            project: "default".to_string(),
            retry: RetryConfig::default(),
            queue: "default.q".to_string(),
            node: Vec::new(),
            sge_project: String::new(),
            settings: PathBuf::from("/opt/gridengine/default/common/settings.sh"),
            monitor_update_interval: 60,
            defaults: DefaultsConfig::default(),
        }
    }
}

fn default_global_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".belay")
        .join("belay.db")
}

impl Config {
    /// Load the merged configuration.
    ///
    /// Order: built-in defaults, then the site file next to the executable,
    /// then `~/.belay.yaml`. The site file is created with defaults when
    /// missing so the deployment has a template to edit.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(site) = site_config_path() {
            if site.exists() {
                config = read_config_file(&site)?;
            } else if let Err(err) = write_default_config(&site, &config) {
                warn!(path = %site.display(), %err, "could not write default config file");
            }
        }

        if let Some(user) = user_config_path() {
            if user.exists() {
                config = read_config_file(&user)?;
            }
        }

        Ok(config)
    }

    /// True when grid submission is allowed from `host`.
    pub fn node_allowed(&self, host: &str) -> bool {
        self.node.is_empty() || self.node.iter().any(|n| n == host)
    }
}

fn site_config_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.parent()?.join("belay.yaml"))
}

fn user_config_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".belay.yaml"))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn write_default_config(path: &Path, config: &Config) -> Result<()> {
    let data = serde_yaml::to_string(config)?;
    std::fs::write(path, data)?;
    Ok(())
}

/// Name of the invoking user.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Hostname of this machine, or `unknown`.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
