//! Load config from file and environment.

use anyhow::Context;
use localdrop_core::NodeConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: ~/.config/localdrop/config.toml or
/// /etc/localdrop/config.toml.
/// Env overrides: LOCALDROP_ROOM, LOCALDROP_NAME, LOCALDROP_DOWNLOAD_DIR,
/// LOCALDROP_MULTICAST_GROUP, LOCALDROP_MULTICAST_PORT, LOCALDROP_CHUNK_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Room to join. Unset: derived from the public IP.
    #[serde(default)]
    pub room: Option<String>,
    /// Announced display name. Unset: random.
    #[serde(default)]
    pub name: Option<String>,
    /// Where received files go (default ~/Downloads).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    /// Rendezvous UDP port (default 45678).
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_multicast_group() -> String {
    "239.255.60.60".to_string()
}
fn default_multicast_port() -> u16 {
    45678
}
fn default_chunk_size() -> usize {
    localdrop_core::config::DEFAULT_CHUNK_SIZE
}
fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room: None,
            name: None,
            download_dir: None,
            multicast_group: default_multicast_group(),
            multicast_port: default_multicast_port(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Config {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            chunk_size: self.chunk_size,
            connect_timeout: self.connect_timeout(),
            ..NodeConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicitly named file must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LOCALDROP_ROOM") {
        c.room = Some(s);
    }
    if let Some(s) = var("LOCALDROP_NAME") {
        c.name = Some(s);
    }
    if let Some(s) = var("LOCALDROP_DOWNLOAD_DIR") {
        c.download_dir = Some(PathBuf::from(s));
    }
    if let Some(s) = var("LOCALDROP_MULTICAST_GROUP") {
        c.multicast_group = s;
    }
    if let Some(s) = var("LOCALDROP_MULTICAST_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.multicast_port = p;
        }
    }
    if let Some(s) = var("LOCALDROP_CHUNK_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.chunk_size = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        out.push(dir.join("localdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/localdrop/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "ignoring config file"),
            }
            break;
        }
    }
    None
}
