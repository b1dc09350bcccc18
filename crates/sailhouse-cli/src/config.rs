//! CLI configuration: command-line flags, environment, then `config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use sailhouse::{Sailhouse, SubscriberOptions, DEFAULT_BASE_URL};
use serde::Deserialize;

const CONFIG_FILE: &str = "config.toml";

/// Contents of the config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub token: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub listen: ListenConfig,
}

/// `[listen]` table: defaults for `sailhouse listen`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_processors")]
    pub processors: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_processors() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            processors: default_processors(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ListenConfig {
    /// Engine options, with command-line overrides applied on top.
    pub fn subscriber_options(
        &self,
        processors: Option<usize>,
        max_retries: Option<u32>,
    ) -> SubscriberOptions {
        SubscriberOptions::new()
            .processors_per_subscription(processors.unwrap_or(self.processors))
            .max_retries(max_retries.unwrap_or(self.max_retries))
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

/// Default config file location, e.g. `~/.config/sailhouse/config.toml`.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "sailhouse", "sailhouse").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Load the config file. A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_path) else {
        return Ok(FileConfig::default());
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => parse(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(FileConfig::default())
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

pub fn parse(contents: &str) -> Result<FileConfig> {
    Ok(toml::from_str(contents)?)
}

/// Connection settings after flag/env/file resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub token: String,
    pub base_url: String,
}

impl Connection {
    /// `token` and `base_url` already hold flag-or-env values (clap reads the
    /// environment); the file fills whatever is still missing.
    pub fn resolve(
        token: Option<String>,
        base_url: Option<String>,
        file: &FileConfig,
    ) -> Result<Self> {
        let token = token
            .or_else(|| file.token.clone())
            .filter(|t| !t.trim().is_empty());
        let Some(token) = token else {
            bail!("no token configured: pass --token, set SAILHOUSE_TOKEN, or add `token` to config.toml");
        };

        let base_url = base_url
            .or_else(|| file.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self { token, base_url })
    }

    pub fn client(&self) -> Result<Sailhouse> {
        Sailhouse::builder(&self.token)
            .base_url(&self.base_url)
            .build()
            .context("failed to create Sailhouse client")
    }
}
