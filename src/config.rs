//! Common configuration shared by every daemon.
//!
//! Loaded once at startup and handed around as `Arc<CommonConfig>`; nothing
//! mutates it afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::timeouts;
use crate::session::Deadlines;

pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    PathBuf::from(".")
}

pub fn config_dir() -> PathBuf {
    home_dir().join(".config").join("robo")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("common.toml")
}

/// Describes one watchdog in the supervision chain
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub name: String,
    pub ip_address: String,
    pub chain_id: u32,
    /// Only for a peer started with `-p`
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    pub enabled: bool,
    pub read_ms: u64,
    pub write_ms: u64,
    /// Bound on waiting for the next message to start; unset means forever
    pub idle_ms: Option<u64>,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        DeadlineConfig {
            enabled: true,
            read_ms: timeouts::READ_MS,
            write_ms: timeouts::WRITE_MS,
            idle_ms: None,
        }
    }
}

impl DeadlineConfig {
    pub fn to_deadlines(&self) -> Deadlines {
        if !self.enabled {
            return Deadlines::disabled();
        }
        Deadlines {
            read: Some(Duration::from_millis(self.read_ms)),
            write: Some(Duration::from_millis(self.write_ms)),
            idle: self.idle_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub monitor_robod: bool,
    pub robod_options: String,
    /// Listen port of the control watchdog when it was started with `-p`
    pub control_port: Option<u16>,
    pub peers: Vec<PeerDescriptor>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            monitor_robod: true,
            robod_options: String::new(),
            control_port: None,
            peers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub home_dir: PathBuf,
    pub log_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub status_dir: PathBuf,
    pub telemetry_dir: PathBuf,
    /// Host that runs the control watchdog
    pub control_host: String,
    pub deadlines: DeadlineConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for CommonConfig {
    fn default() -> Self {
        let root = home_dir().join("robo");
        CommonConfig {
            home_dir: home_dir(),
            log_dir: root.join("Logs"),
            bin_dir: root.join("bin"),
            status_dir: root.join("Status"),
            telemetry_dir: root.join("Telemetry"),
            control_host: "localhost".to_string(),
            deadlines: DeadlineConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl CommonConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse common configuration")
    }

    /// Load from `path`, or from the default location. A missing default
    /// file yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                Self::parse(&text)
            }
            None => {
                let p = default_config_path();
                if p.exists() {
                    let text = std::fs::read_to_string(&p)
                        .with_context(|| format!("read config {}", p.display()))?;
                    Self::parse(&text)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn log_file(&self, executable: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", executable))
    }

    pub fn lock_file(&self, executable: &str) -> PathBuf {
        self.status_dir.join(format!("{}.running", executable))
    }

    pub fn status_file(&self, executable: &str) -> PathBuf {
        self.status_dir.join(format!("{}_status", executable))
    }

    pub fn telemetry_file(&self, executable: &str) -> PathBuf {
        self.telemetry_dir.join(format!("{}.dat", executable))
    }
}
