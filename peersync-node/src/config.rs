//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use peersync_core::{PeerId, SessionConfig};
use serde::Deserialize;

/// Node configuration. File: `--config <path>`, else ~/.config/peersync/config.toml or /etc/peersync/config.toml.
/// Env overrides: PEERSYNC_LISTEN_PORT, PEERSYNC_SERVER_ADDR, PEERSYNC_PASSWORD, PEERSYNC_PEER_ID,
/// PEERSYNC_HEARTBEAT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Server TCP listen port (default 45700).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address a client dials (default 127.0.0.1:45700).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Peer ID the server runs under and clients address (default "server").
    #[serde(default = "default_server_id")]
    pub server_id: PeerId,
    /// This client's peer ID; a random one is generated when absent.
    #[serde(default)]
    pub peer_id: Option<PeerId>,
    /// Shared credential checked on `init`. Empty disables the check.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_listen_port() -> u16 {
    45700
}
fn default_server_addr() -> String {
    "127.0.0.1:45700".into()
}
fn default_server_id() -> PeerId {
    PeerId::from("server")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            server_addr: default_server_addr(),
            server_id: default_server_id(),
            peer_id: None,
            password: String::new(),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// This node's client peer ID. Stable once `load` has run.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id.clone().unwrap_or_else(PeerId::generate)
    }
}

/// Load config: merge default, then config file, then env vars.
/// An explicit `--config` path must exist and parse; the default locations are best effort.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    if c.peer_id.is_none() {
        c.peer_id = Some(PeerId::generate());
    }
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<NodeConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peersync/config.toml"));
    }
    out.push(PathBuf::from("/etc/peersync/config.toml"));
    out
}

fn load_default_file() -> Option<NodeConfig> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(path = %p.display(), error = ?e, "ignoring config file"),
            }
            break;
        }
    }
    None
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PEERSYNC_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.listen_port = p;
    }
    if let Some(addr) = var("PEERSYNC_SERVER_ADDR") {
        c.server_addr = addr;
    }
    if let Some(password) = var("PEERSYNC_PASSWORD") {
        c.password = password;
    }
    if let Some(id) = var("PEERSYNC_PEER_ID").filter(|s| !s.is_empty()) {
        c.peer_id = Some(PeerId::new(id));
    }
    if let Some(ms) = var("PEERSYNC_HEARTBEAT_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.session.heartbeat_period_ms = ms;
    }
}
