//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/parcel/config.toml or /etc/parcel/config.toml.
/// Env overrides: PARCEL_NODE_NAME, PARCEL_LISTEN_PORT, PARCEL_RESOURCE_DIR,
/// PARCEL_PEERS, PARCEL_PENDING_TTL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced to peers (default: host name).
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// TCP listen port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Addresses dialled at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Where received resources are kept (default ~/.local/share/parcel/inbox).
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,
    /// Eviction age of half-received messages; 0 disables eviction (default 300).
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "parcel".to_string())
}
fn default_listen_port() -> u16 {
    45680
}
fn default_resource_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/parcel/inbox"),
        None => PathBuf::from("/var/lib/parcel/inbox"),
    }
}
fn default_pending_ttl_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            listen_port: default_listen_port(),
            peers: Vec::new(),
            resource_dir: default_resource_dir(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

impl Config {
    pub fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_secs > 0).then(|| Duration::from_secs(self.pending_ttl_secs))
    }

    /// Apply `PARCEL_*` overrides from `var`. Unparsable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PARCEL_NODE_NAME") {
            self.node_name = s;
        }
        if let Some(s) = var("PARCEL_LISTEN_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.listen_port = p,
                Err(_) => warn!(value = %s, "ignoring invalid PARCEL_LISTEN_PORT"),
            }
        }
        if let Some(s) = var("PARCEL_RESOURCE_DIR") {
            self.resource_dir = PathBuf::from(s);
        }
        if let Some(s) = var("PARCEL_PEERS") {
            match parse_peers(&s) {
                Ok(peers) => self.peers = peers,
                Err(e) => warn!(value = %s, error = %e, "ignoring invalid PARCEL_PEERS"),
            }
        }
        if let Some(s) = var("PARCEL_PENDING_TTL_SECS") {
            match s.parse::<u64>() {
                Ok(secs) => self.pending_ttl_secs = secs,
                Err(_) => warn!(value = %s, "ignoring invalid PARCEL_PENDING_TTL_SECS"),
            }
        }
    }
}

fn parse_peers(s: &str) -> Result<Vec<SocketAddr>, std::net::AddrParseError> {
    s.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::parse)
        .collect()
}

/// Load config: default, then config file, then env vars. An explicit `path` must
/// exist and parse; the default locations are optional.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    c.apply_env(|name| std::env::var(name).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/parcel/config.toml"));
    }
    out.push(PathBuf::from("/etc/parcel/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{e:#}"), "ignoring unreadable config");
            None
        }
    }
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
