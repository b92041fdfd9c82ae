//! Server configuration: a TOML file plus environment overrides.
//!
//! # Environment Variables
//!
//! - `ROOST_CONFIG`: path to the configuration file (overridden by
//!   `--config`). Without either, built-in defaults serve `localhost`.
//! - `ROOST_HOSTS`: comma-separated list overriding `[server].hosts`.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

fn default_hosts() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_server_name() -> String {
    "roost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Domains the session manager serves.
    pub hosts: Vec<String>,
    /// Name announced in service discovery.
    pub name: String,
    /// Message types the offline spool accepts.
    pub store_offline: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            name: default_server_name(),
            store_offline: ["normal", "chat", "headline", "groupchat", "error"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XdbSection {
    pub retry_secs: u64,
    pub expire_secs: u64,
    pub sweep_secs: u64,
}

impl Default for XdbSection {
    fn default() -> Self {
        Self {
            retry_secs: 10,
            expire_secs: 30,
            sweep_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RouterSection {
    /// Bounce unroutable stanzas as `remote-server-not-found` instead of
    /// `service-unavailable`.
    pub bounce_remote_not_found: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptSection {
    pub id: String,
    pub bind: String,
    pub secret: String,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSection {
    pub id: String,
    pub addr: String,
    pub secret: String,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect_secs: u64,
}

fn default_queue_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_reconnect() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServiceSection {
    pub jid: String,
    pub name: Option<String>,
    pub category: String,
    pub service_type: String,
    pub admin_only: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DirectorySection {
    /// Bare JIDs allowed to see admin-only directory entries.
    pub admins: Vec<String>,
    pub services: Vec<ServiceSection>,
}

/// Whole-server configuration tree.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub xdb: XdbSection,
    pub router: RouterSection,
    pub accept: Vec<AcceptSection>,
    pub connect: Vec<ConnectSection>,
    pub directory: DirectorySection,
}

impl Config {
    /// Load from a file, or fall back to defaults when none is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Ok(hosts) = std::env::var("ROOST_HOSTS") {
            config.server.hosts = hosts
                .split(',')
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty())
                .collect();
        }
        Ok(config)
    }

    pub fn log_config(&self) {
        info!(hosts = ?self.server.hosts, "serving domains");
        info!(
            accept = self.accept.len(),
            connect = self.connect.len(),
            "component links configured"
        );
    }

    pub fn xdb_config(&self) -> roost_xmpp::xdb::XdbConfig {
        roost_xmpp::xdb::XdbConfig {
            retry: Duration::from_secs(self.xdb.retry_secs),
            expire: Duration::from_secs(self.xdb.expire_secs),
            sweep: Duration::from_secs(self.xdb.sweep_secs),
        }
    }
}
