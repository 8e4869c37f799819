use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mastodon::DEFAULT_PAGE_SIZE;
use crate::timeline::{FeedOptions, DEFAULT_LIMIT, DEFAULT_RETRY_DELAY};

const DEFAULT_ENV_PREFIX: &str = "TREEDER";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Instance to read from when none is given on the command line.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            access_token: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("treeder/{} (+https://github.com/iliazeus/treeder)", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            limit: default_limit(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl FeedConfig {
    pub fn options(&self) -> FeedOptions {
        FeedOptions {
            page_size: self.page_size,
            limit: self.limit,
            retry_delay: self.retry_delay,
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = apply_env(cfg, &env_values(prefix));

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.instance.host.is_empty() {
        base.instance.host = other.instance.host;
    }
    if !other.instance.access_token.is_empty() {
        base.instance.access_token = other.instance.access_token;
    }
    if !other.instance.user_agent.is_empty() {
        base.instance.user_agent = other.instance.user_agent;
    }

    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    if other.feed.limit != 0 {
        base.feed.limit = other.feed.limit;
    }
    base.feed.retry_delay = other.feed.retry_delay;

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

fn env_values(prefix: &str) -> HashMap<String, String> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

/// Overrides only what the environment actually sets.
fn apply_env(mut cfg: Config, values: &HashMap<String, String>) -> Config {
    for (key, value) in values {
        let value = value.clone();
        match key.as_str() {
            "instance.host" => cfg.instance.host = value,
            "instance.access_token" => cfg.instance.access_token = value,
            "instance.user_agent" => cfg.instance.user_agent = value,
            "feed.page_size" => {
                if let Ok(parsed) = value.parse::<u32>() {
                    cfg.feed.page_size = parsed;
                }
            }
            "feed.limit" => {
                if let Ok(parsed) = value.parse::<usize>() {
                    cfg.feed.limit = parsed;
                }
            }
            "feed.retry_delay" => {
                if let Ok(duration) = humantime::parse_duration(&value) {
                    cfg.feed.retry_delay = duration;
                }
            }
            "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
            _ => {}
        }
    }
    cfg
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("treeder").join("config.yaml"))
}
