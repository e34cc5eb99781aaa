//! Application configuration management.
//!
//! The config file holds the cache directory, the default refresh skew and
//! a provider command per identity. It lives at
//! `~/.config/stscache/config.json` unless `STSCACHE_CONFIG` points elsewhere.
//!
//! Resolution order for each setting: command-line flag, environment
//! variable, config file, built-in default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stscache_core::cache::APP_NAME;
use stscache_core::{FileCacheStore, DEFAULT_SKEW};

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_CONFIG: &str = "STSCACHE_CONFIG";
pub const ENV_CACHE_DIR: &str = "STSCACHE_CACHE_DIR";
pub const ENV_SKEW: &str = "STSCACHE_SKEW_SECONDS";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub cache_dir: Option<PathBuf>,
    pub skew_seconds: Option<u64>,
    /// Provider command (argv) per identity
    pub providers: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load from `STSCACHE_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        let path = Self::config_path(|key| std::env::var(key).ok())?;
        Self::load_from(&path)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(path) = env(ENV_CONFIG).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(
        &self,
        flag: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<PathBuf> {
        if let Some(dir) = flag {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = env(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        FileCacheStore::default_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))
    }

    pub fn skew(&self, flag: Option<u64>, env: impl Fn(&str) -> Option<String>) -> Result<Duration> {
        if let Some(secs) = flag {
            return Ok(Duration::from_secs(secs));
        }
        if let Some(value) = env(ENV_SKEW) {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got `{}`", ENV_SKEW, value))?;
            return Ok(Duration::from_secs(secs));
        }
        Ok(self
            .skew_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SKEW))
    }

    pub fn provider_command(&self, identity: &str) -> Option<&[String]> {
        self.providers
            .get(identity)
            .map(Vec::as_slice)
            .filter(|argv| !argv.is_empty())
    }
}
