// src/config.rs

//! Manages server configuration: loading, resolving machine specs, and validation.
//!
//! A deliberate substitution for the original "restricted Python eval"
//! mechanism: plain TOML parsed with `serde`, validated after parse.

use crate::core::board::{BoardAddress, Link};
use crate::core::machine::{MachineSpec, Triad};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::time::Duration;

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8877
}

/// One board's position within a machine's triad grid, as written in the
/// config file: its logical triad coordinates, its physical address, and
/// (if it's an Ethernet-connected board) the IP of its Ethernet chip.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BoardEntry {
    pub triad: Triad,
    pub address: BoardAddress,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeadLinkEntry {
    pub board: BoardAddress,
    pub link: Link,
}

/// Raw, as-written machine entry. Converted into `MachineSpec`'s coordinate
/// tables by `into_spec`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RawMachineConfig {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub dead_boards: BTreeSet<BoardAddress>,
    #[serde(default)]
    pub dead_links: Vec<DeadLinkEntry>,
    #[serde(default)]
    pub boards: Vec<BoardEntry>,
    #[serde(default = "default_bmp_port")]
    pub bmp_port: u16,
}

fn default_bmp_port() -> u16 {
    54321
}

impl RawMachineConfig {
    fn into_spec(self) -> Result<MachineSpec> {
        let mut triad_to_board = HashMap::with_capacity(self.boards.len());
        let mut triad_to_ip = HashMap::new();
        let mut bmp_hosts = HashMap::new();
        for entry in &self.boards {
            triad_to_board.insert(entry.triad, entry.address);
            if let Some(ip) = &entry.ip {
                triad_to_ip.insert(entry.triad, ip.clone());
                bmp_hosts
                    .entry((entry.address.cabinet, entry.address.frame))
                    .or_insert_with(|| ip.clone());
            }
        }
        let dead_links = self
            .dead_links
            .into_iter()
            .map(|e| (e.board, e.link))
            .collect();

        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "machine '{}': width and height must both be non-zero",
                self.name
            ));
        }

        Ok(MachineSpec {
            name: self.name,
            tags: self.tags,
            width: self.width,
            height: self.height,
            dead_boards: self.dead_boards,
            dead_links,
            triad_to_board,
            bmp_hosts,
            triad_to_ip,
            bmp_port: self.bmp_port,
        })
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_retired_jobs")]
    max_retired_jobs: usize,
    #[serde(default = "default_timeout_check_interval", with = "humantime_serde")]
    timeout_check_interval: Duration,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    machines: Vec<RawMachineConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    22244
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_retired_jobs() -> usize {
    1200
}
fn default_timeout_check_interval() -> Duration {
    Duration::from_secs(5)
}

/// The resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_retired_jobs: usize,
    pub timeout_check_interval: Duration,
    pub metrics: MetricsConfig,
    /// Machine specs, in the order given in the config file. Order is
    /// observable via `list_machines` and is preserved through reload.
    pub machines: Vec<MachineSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_retired_jobs: default_max_retired_jobs(),
            timeout_check_interval: default_timeout_check_interval(),
            metrics: MetricsConfig::default(),
            machines: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and parses a TOML config file, producing a validated `Config`.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let mut machines = Vec::with_capacity(raw.machines.len());
        for m in raw.machines {
            machines.push(m.into_spec()?);
        }

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            max_retired_jobs: raw.max_retired_jobs,
            timeout_check_interval: raw.timeout_check_interval,
            metrics: raw.metrics,
            machines,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.timeout_check_interval.is_zero() {
            return Err(anyhow!("timeout_check_interval cannot be 0"));
        }

        let mut seen = BTreeSet::new();
        for m in &self.machines {
            if !seen.insert(m.name.clone()) {
                return Err(anyhow!("duplicate machine name '{}'", m.name));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let f = write_config("host = \"127.0.0.1\"\nport = 22244\n");
        let config = Config::from_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_retired_jobs, default_max_retired_jobs());
        assert!(config.machines.is_empty());
    }

    #[test]
    fn parses_machine_with_boards() {
        let f = write_config(
            r#"
            host = "127.0.0.1"
            port = 22244

            [[machines]]
            name = "m1"
            tags = ["default"]
            width = 1
            height = 1

            [[machines.boards]]
            triad = [0, 0, 0]
            address = { cabinet = 0, frame = 0, board = 0 }
            ip = "10.0.0.1"
            "#,
        );
        let config = Config::from_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(config.machines.len(), 1);
        assert_eq!(config.machines[0].name, "m1");
        assert_eq!(
            config.machines[0].triad_to_board.get(&(0, 0, 0)),
            Some(&BoardAddress::new(0, 0, 0))
        );
    }

    #[test]
    fn rejects_zero_port() {
        let f = write_config("port = 0\n");
        assert!(Config::from_file(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn rejects_duplicate_machine_names() {
        let f = write_config(
            r#"
            [[machines]]
            name = "dup"
            width = 1
            height = 1

            [[machines]]
            name = "dup"
            width = 1
            height = 1
            "#,
        );
        assert!(Config::from_file(f.path().to_str().unwrap()).is_err());
    }
}
