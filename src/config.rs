use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV: &str = "PAGEBRIDGE_CONFIG";

const MAX_MESSAGE_LOOP_HZ: u32 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Tuning for the message-pump force policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lowest rate the engine is pumped at, even with nothing requested.
    pub min_message_loop_hz: u32,
    /// Highest rate of forced pumps while pages are active.
    pub max_forced_message_loop_hz: u32,
    /// Force pumps even when no page session is active.
    pub force_message_loop: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_message_loop_hz: 1,
            max_forced_message_loop_hz: 15,
            force_message_loop: false,
        }
    }
}

impl SchedulerConfig {
    /// Clamps `min` to [1, 60] and `max_forced` to [min, 60].
    pub fn clamped(&self) -> Self {
        let min = self.min_message_loop_hz.clamp(1, MAX_MESSAGE_LOOP_HZ);
        let max_forced = self
            .max_forced_message_loop_hz
            .clamp(min, MAX_MESSAGE_LOOP_HZ);
        Self {
            min_message_loop_hz: min,
            max_forced_message_loop_hz: max_forced,
            force_message_loop: self.force_message_loop,
        }
    }

    pub fn min_interval(&self) -> Duration {
        hz_to_interval(self.min_message_loop_hz)
    }

    pub fn max_forced_interval(&self) -> Duration {
        hz_to_interval(self.max_forced_message_loop_hz)
    }
}

fn hz_to_interval(hz: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(hz.max(1)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub scheduler: SchedulerConfig,
    /// Expose binding and method names in lower case and match them
    /// case-insensitively.
    pub lowercase_binding_names: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            lowercase_binding_names: true,
        }
    }
}

impl BridgeConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str::<BridgeConfig>(&contents)?
            }
            _ => BridgeConfig::default(),
        };

        Ok(Self {
            scheduler: config.scheduler.clamped(),
            ..config
        })
    }

    /// `$PAGEBRIDGE_CONFIG`, else `bridge.yaml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("org", "pagebridge", "pagebridge")
            .map(|dirs| dirs.config_dir().join("bridge.yaml"))
    }
}
