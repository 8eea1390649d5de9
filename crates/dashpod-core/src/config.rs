//! Configuration resolution for dashpod.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, else ~/.config/dashpod/config.json)
//! 3. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::PodConstants;
use crate::error::{Error, Result};
use crate::ids::{DEFAULT_CONTROLLER_ID, Ids};

/// Complete communications configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// The controller's own address.
    pub controller_id: u32,
    /// Pod address candidate from discovery, when the radio layer has one.
    pub pod_address_hint: Option<u32>,
    /// Deadline for each radio round trip.
    pub response_timeout_ms: u64,
    /// Where the pod state is persisted. `None` keeps it in memory.
    pub state_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
    /// Hardware constants a compatible pod must report.
    pub expected_constants: PodConstants,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            controller_id: DEFAULT_CONTROLLER_ID,
            pod_address_hint: None,
            response_timeout_ms: 10_000,
            state_path: None,
            log_level: "info".to_string(),
            log_json: false,
            expected_constants: PodConstants::default(),
        }
    }
}

impl CommsConfig {
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub const fn ids(&self) -> Ids {
        Ids::new(self.controller_id, self.pod_address_hint)
    }
}

/// Load configuration with hierarchical resolution.
///
/// A missing default config file is not an error; a missing explicit one is.
pub fn load_config(path: Option<&Path>) -> Result<CommsConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => CommsConfig::default(),
        },
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".dashpod").join("config.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/dashpod/config.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("dashpod").join("config.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<CommsConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut CommsConfig) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply `DASHPOD_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored with a warning, leaving the
/// lower-priority setting in place.
pub fn apply_env_overrides_from(config: &mut CommsConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("DASHPOD_CONTROLLER_ID") {
        match parse_address(&val) {
            Some(id) => config.controller_id = id,
            None => tracing::warn!(value = %val, "ignoring invalid DASHPOD_CONTROLLER_ID"),
        }
    }
    if let Some(val) = lookup("DASHPOD_POD_ADDRESS_HINT") {
        match parse_address(&val) {
            Some(hint) => config.pod_address_hint = Some(hint),
            None => tracing::warn!(value = %val, "ignoring invalid DASHPOD_POD_ADDRESS_HINT"),
        }
    }
    if let Some(val) = lookup("DASHPOD_RESPONSE_TIMEOUT_MS") {
        match val.trim().parse() {
            Ok(ms) => config.response_timeout_ms = ms,
            Err(_) => tracing::warn!(value = %val, "ignoring invalid DASHPOD_RESPONSE_TIMEOUT_MS"),
        }
    }
    if let Some(val) = lookup("DASHPOD_STATE_PATH") {
        config.state_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("DASHPOD_LOG_LEVEL") {
        config.log_level = val;
    }
}

/// Parse a `0x`-prefixed hex or a decimal address.
pub fn parse_address(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
