//! Load config from file and environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use peerlink_core::{ContactInfo, ContactMethod, PeerId, TransportConfig};
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_LISTEN_PORT, PEERLINK_STORE_DIR, PEERLINK_LOCAL_ID.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our identity (default: a fresh `urn:uuid:` per start).
    #[serde(default = "default_local_id")]
    pub local_id: PeerId,
    /// TCP listen port (default 7771).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Blob directory (default: `$TMPDIR/peerlink`).
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Static routing table.
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,
}

/// One `[[contacts]]` row: a way to reach `peer`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContactEntry {
    pub peer: PeerId,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

fn default_local_id() -> PeerId {
    PeerId::new(format!("urn:uuid:{}", uuid::Uuid::new_v4()))
}
fn default_listen_port() -> u16 {
    7771
}
fn default_store_dir() -> PathBuf {
    std::env::temp_dir().join("peerlink")
}
fn default_protocol() -> String {
    "tcp".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: default_local_id(),
            listen_port: default_listen_port(),
            store_dir: default_store_dir(),
            transport: TransportConfig::default(),
            contacts: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Contact rows grouped per peer, in file order.
    pub fn contact_table(&self) -> HashMap<PeerId, ContactInfo> {
        let mut table: HashMap<PeerId, ContactInfo> = HashMap::new();
        for entry in &self.contacts {
            table
                .entry(entry.peer.clone())
                .or_insert_with(|| ContactInfo::new(Vec::new()))
                .methods
                .push(ContactMethod::new(
                    entry.protocol.as_str(),
                    entry.host.as_str(),
                    entry.port,
                ));
        }
        table
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PEERLINK_LISTEN_PORT") {
            match s.parse::<u16>() {
                Ok(p) => self.listen_port = p,
                Err(_) => warn!("ignoring PEERLINK_LISTEN_PORT={:?}", s),
            }
        }
        if let Some(s) = var("PEERLINK_STORE_DIR") {
            self.store_dir = PathBuf::from(s);
        }
        if let Some(s) = var("PEERLINK_LOCAL_ID") {
            if !s.is_empty() {
                self.local_id = PeerId::new(s);
            }
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
/// A file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    debug!("loading config from {}", path.display());
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Config::parse(&s).with_context(|| format!("parsing {}", path.display()))
}
