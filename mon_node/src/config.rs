// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node configuration.
//!
//! Loaded from a YAML, TOML or JSON file (picked by suffix), from the
//! OS-conventional user config directory when no path is given, or from
//! stdin when the path is `-`.

use crate::{Error, Result};
use mon_interface::Algorithm;

use serde::Deserialize;
use std::{
    collections::HashMap,
    io::Read,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

/// Name of the config file searched for under the user config directory.
const DEFAULT_CONF_STEM: &str = "monitord";

/// Suffixes searched, in order, when no explicit path is given.
const DEFAULT_CONF_SUFFIXES: &[&str] = &["yaml", "yml", "toml", "json"];

/// Complete node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional tracing filter directive, e.g. `mon_node=debug`.
    #[serde(default)]
    pub log: Option<String>,
    /// Observer Server endpoint.
    pub server: ServerConfig,
    /// Observer Master endpoint.
    pub master: MasterConfig,
    /// Operator surface endpoint; the UI is not started when absent.
    #[serde(default)]
    pub ui: Option<UiConfig>,
    /// Federation parameters.
    pub slave: SlaveConfig,
    /// Election policy for groups without an explicit entry.
    pub default_algorithm: Algorithm,
    /// Per-group election policy overrides.
    #[serde(default)]
    pub group_algorithms: HashMap<String, Algorithm>,
}

/// Observer Server endpoint and defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Rank assigned to components with no cached rank.
    #[serde(default = "default_rank")]
    pub default_rank: i64,
}

/// Observer Master endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

/// Operator surface endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UiConfig {
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

/// Federation parameters of the runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlaveConfig {
    /// Master addresses to try, in order. With no parents this node is
    /// permanently the master.
    #[serde(default)]
    pub parents: Vec<ParentConfig>,
    /// Seconds allowed for a single connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    /// Retry rounds over the parent list before the local master takes
    /// over; `None` retries forever.
    #[serde(default = "default_connect_retry_count")]
    pub connect_retry_count: Option<u64>,
    /// Seconds between retry rounds.
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay: f64,
}

/// One parent address.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParentConfig {
    /// Parent host.
    pub host: String,
    /// Parent port.
    pub port: u16,
}

fn default_rank() -> i64 {
    1
}

fn default_connect_timeout() -> f64 {
    2.0
}

fn default_connect_retry_count() -> Option<u64> {
    Some(3)
}

fn default_connect_retry_delay() -> f64 {
    0.5
}

impl Config {
    /// Check the parts serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !self.slave.connect_timeout.is_finite() || self.slave.connect_timeout < 0.0 {
            return Err(Error::InvalidConfig(
                "slave.connect_timeout must be a non-negative number of seconds".to_string(),
            ));
        }
        if !self.slave.connect_retry_delay.is_finite() || self.slave.connect_retry_delay < 0.0 {
            return Err(Error::InvalidConfig(
                "slave.connect_retry_delay must be a non-negative number of seconds".to_string(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Resolved listen address.
    pub fn addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

impl MasterConfig {
    /// Resolved listen address.
    pub fn addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

impl UiConfig {
    /// Resolved listen address.
    pub fn addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

impl ParentConfig {
    /// Resolved parent address.
    pub fn addr(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

impl SlaveConfig {
    /// Connection attempt timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout)
    }

    /// Delay between retry rounds.
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.connect_retry_delay)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| Error::InvalidConfig(format!("cannot resolve {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| Error::InvalidConfig(format!("cannot resolve {host}:{port}")))
}

/// Load the configuration: from `path` when given (`-` meaning stdin),
/// otherwise from the first matching default location.
pub fn load(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) if path == Path::new("-") => {
            let mut content = String::new();
            let _ = std::io::stdin()
                .read_to_string(&mut content)
                .map_err(|err| Error::InvalidConfig(format!("reading stdin failed: {err}")))?;
            // YAML is a superset of JSON, so stdin accepts either.
            parse_yaml(&content)?
        }
        Some(path) => load_file(&path)?,
        None => {
            let path = default_path().ok_or_else(|| {
                Error::InvalidConfig(
                    "no --conf given and no default configuration file found".to_string(),
                )
            })?;
            load_file(&path)?
        }
    };

    config.validate()?;
    Ok(config)
}

/// First existing default config file, if any.
pub fn default_path() -> Option<PathBuf> {
    let base = dirs_next::config_dir()?.join(DEFAULT_CONF_STEM);
    DEFAULT_CONF_SUFFIXES
        .iter()
        .map(|suffix| base.join(format!("{DEFAULT_CONF_STEM}.{suffix}")))
        .find(|candidate| candidate.exists())
}

fn load_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::InvalidConfig(format!("reading {} failed: {err}", path.display())))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => parse_yaml(&content),
        Some("toml") => toml::from_str(&content)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.display()))),
        Some("json") => serde_json::from_str(&content)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.display()))),
        _ => Err(Error::InvalidConfig(format!(
            "unsupported configuration suffix: {}",
            path.display()
        ))),
    }
}

fn parse_yaml(content: &str) -> Result<Config> {
    serde_yaml::from_str(content).map_err(|err| Error::InvalidConfig(err.to_string()))
}
