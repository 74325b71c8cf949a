//! Config loading and persistence.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::net::transport::DEFAULT_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory (store + logs). Defaults to the XDG
    /// data dir.
    pub data_dir: Option<PathBuf>,
    /// Bundled pass snapshot, loaded into the store on first run.
    pub passes_path: Option<PathBuf>,
    pub net: NetConfig,
    pub timers: TimerConfig,
    pub gossip: GossipConfig,
    pub admission: AdmissionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            passes_path: None,
            net: NetConfig::default(),
            timers: TimerConfig::default(),
            gossip: GossipConfig::default(),
            admission: AdmissionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub port: u16,
    /// Subnet-directed broadcast override; limited broadcast when unset.
    pub broadcast_addr: Option<Ipv4Addr>,
    /// Single-datagram bound; full-state messages over this are skipped and
    /// hash reconciliation repairs instead.
    pub max_datagram_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast_addr: None,
            max_datagram_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub heartbeat_ms: u64,
    pub retry_ack_ms: u64,
    pub state_hash_ms: u64,
    pub full_sync_ms: u64,
    pub retry_queue_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 10_000,
            retry_ack_ms: 2_000,
            state_hash_ms: 20_000,
            full_sync_ms: 30_000,
            retry_queue_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Pending delta age before it is resent.
    pub ack_timeout_ms: u64,
    /// Send attempts per message (ACK retries and queued broadcasts alike).
    pub max_send_attempts: u32,
    /// Queued broadcasts drained per retry-queue tick.
    pub retry_batch: usize,
    /// Received-message-id dedup cache capacity.
    pub received_cache_size: usize,
    /// Peer liveness window.
    pub liveness_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_send_attempts: 5,
            retry_batch: 10,
            received_cache_size: 1_000,
            liveness_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Repeat-scan cooldown for the same code on the same day.
    pub cooldown_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { cooldown_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stderr: bool,
    pub format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stderr: true,
            format: LogFormat::Compact,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    /// Defaults to `{data_dir}/logs`.
    pub dir: Option<PathBuf>,
}

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load_from(path: &Path) -> crate::Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

/// Load the config, falling back to defaults (and writing them out) when the
/// file is missing or unreadable.
pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load_from(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(&path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> crate::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> crate::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> crate::Error {
    crate::Error::Config { reason }
}
