//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use pump_core::chunk::MIN_CHUNK_SIZE;
use pump_core::integrity::DEFAULT_BOND_LOSS_THRESHOLD;
use pump_core::scheduler::{HISTORY_LOOKBACK_INDICES, MAX_HISTORY_BATCH};
use pump_core::{AuthError, PairingCode, DEFAULT_CHUNK_SIZE};

use crate::manager::{HistoryConfig, LinkConfig};

/// Daemon configuration. File: ~/.config/pumplink/config.toml or /etc/pumplink/config.toml.
/// Env overrides: PUMPLINK_ADDRESS, PUMPLINK_PAIRING_CODE, PUMPLINK_POLL_SECS, PUMPLINK_STATE_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pump BLE address, e.g. "C4:7F:51:00:11:22".
    #[serde(default)]
    pub address: Option<String>,
    /// Code shown on the pump: 6 digits (JPAKE) or 16 characters (legacy).
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub app_instance_id: u16,
    /// Bytes per BLE write (default 20).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Where the history cursor survives restarts. Unset keeps it in memory only.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub bond: BondSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistorySection {
    #[serde(default = "default_lookback")]
    pub lookback_indices: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u8,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_max_records")]
    pub max_records: u32,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BondSection {
    #[serde(default = "default_bond_threshold")]
    pub threshold: u32,
    /// A link that drops sooner than this counts as a rapid disconnect.
    #[serde(default = "default_rapid_disconnect_secs")]
    pub rapid_disconnect_secs: u64,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_poll_interval_secs() -> u64 {
    300
}
fn default_lookback() -> u32 {
    HISTORY_LOOKBACK_INDICES
}
fn default_batch_size() -> u8 {
    MAX_HISTORY_BATCH
}
fn default_stagger_ms() -> u64 {
    250
}
fn default_max_records() -> u32 {
    200
}
fn default_deadline_ms() -> u64 {
    20_000
}
fn default_bond_threshold() -> u32 {
    DEFAULT_BOND_LOSS_THRESHOLD
}
fn default_rapid_disconnect_secs() -> u64 {
    15
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            lookback_indices: default_lookback(),
            batch_size: default_batch_size(),
            stagger_ms: default_stagger_ms(),
            max_records: default_max_records(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl Default for BondSection {
    fn default() -> Self {
        Self {
            threshold: default_bond_threshold(),
            rapid_disconnect_secs: default_rapid_disconnect_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            pairing_code: None,
            app_instance_id: 0,
            chunk_size: default_chunk_size(),
            request_timeout_ms: default_request_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            state_path: None,
            history: HistorySection::default(),
            bond: BondSection::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Typed settings for the connection manager. Fails without a usable pairing code.
    pub fn link_config(&self) -> Result<LinkConfig, AuthError> {
        let code = self
            .pairing_code
            .as_deref()
            .ok_or(AuthError::InvalidPairingCode)?;
        Ok(LinkConfig {
            pairing_code: PairingCode::parse(code)?,
            app_instance_id: self.app_instance_id,
            chunk_size: self.chunk_size.max(MIN_CHUNK_SIZE),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            history: HistoryConfig {
                lookback_indices: self.history.lookback_indices.max(1),
                batch_size: self.history.batch_size.clamp(1, MAX_HISTORY_BATCH),
                stagger: Duration::from_millis(self.history.stagger_ms),
                max_records: self.history.max_records,
                deadline: Duration::from_millis(self.history.deadline_ms),
            },
            bond_threshold: self.bond.threshold.max(1),
            rapid_disconnect: Duration::from_secs(self.bond.rapid_disconnect_secs),
        })
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PUMPLINK_ADDRESS") {
        c.address = Some(s);
    }
    if let Some(s) = var("PUMPLINK_PAIRING_CODE") {
        c.pairing_code = Some(s);
    }
    if let Some(s) = var("PUMPLINK_POLL_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.poll_interval_secs = secs;
        }
    }
    if let Some(s) = var("PUMPLINK_STATE_PATH") {
        c.state_path = Some(PathBuf::from(s));
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pumplink/config.toml"));
    }
    out.push(PathBuf::from("/etc/pumplink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
