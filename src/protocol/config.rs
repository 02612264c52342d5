//! Protocol parameters.
//!
//! Defaults match the deployed configuration: a 3 s round split into a
//! 250 ms advertisement phase, a 1 s reply phase and the steady-state
//! remainder, a 5% target head fraction, and a 64-entry/30 s deferred queue.
//! Scenes may override any field, and a sidecar `config.toml` next to the
//! scene file takes precedence over both.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::clock::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Target fraction of nodes electing themselves head per round (P).
    #[serde(default = "default_head_fraction")]
    pub cluster_head_fraction: f64,
    /// Full round length.
    #[serde(default = "default_round_ms")]
    pub round_duration_ms: u64,
    /// Length of the advertisement phase at the start of each round.
    #[serde(default = "default_advertise_ms")]
    pub advertise_duration_ms: u64,
    /// Length of the join-reply phase following the advertisement phase.
    #[serde(default = "default_reply_ms")]
    pub reply_duration_ms: u64,
    /// Capacity of the deferred packet queue.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,
    /// Maximum time a packet may sit in the deferred queue.
    #[serde(default = "default_max_queue_time_ms")]
    pub max_queue_time_ms: u64,
}

fn default_head_fraction() -> f64 {
    0.05
}

fn default_round_ms() -> u64 {
    3_000
}

fn default_advertise_ms() -> u64 {
    250
}

fn default_reply_ms() -> u64 {
    1_000
}

fn default_max_queue_len() -> usize {
    64
}

fn default_max_queue_time_ms() -> u64 {
    30_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            cluster_head_fraction: default_head_fraction(),
            round_duration_ms: default_round_ms(),
            advertise_duration_ms: default_advertise_ms(),
            reply_duration_ms: default_reply_ms(),
            max_queue_len: default_max_queue_len(),
            max_queue_time_ms: default_max_queue_time_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn round_duration(&self) -> Duration {
        Duration::from_millis(self.round_duration_ms)
    }

    pub fn advertise_duration(&self) -> Duration {
        Duration::from_millis(self.advertise_duration_ms)
    }

    pub fn reply_duration(&self) -> Duration {
        Duration::from_millis(self.reply_duration_ms)
    }

    pub fn max_queue_time(&self) -> Duration {
        Duration::from_millis(self.max_queue_time_ms)
    }

    /// Rounds per rotation epoch, ceil(1/P).
    pub fn epoch_rounds(&self) -> u64 {
        (1.0 / self.cluster_head_fraction).ceil() as u64
    }

    /// Check that the parameters describe a usable round.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.cluster_head_fraction > 0.0 && self.cluster_head_fraction <= 1.0) {
            return Err(format!(
                "cluster_head_fraction must be in (0, 1], got {}",
                self.cluster_head_fraction
            ));
        }
        if self.round_duration_ms <= self.advertise_duration_ms + self.reply_duration_ms {
            return Err(format!(
                "round_duration_ms ({}) must exceed advertise ({}) + reply ({})",
                self.round_duration_ms, self.advertise_duration_ms, self.reply_duration_ms
            ));
        }
        if self.max_queue_len == 0 {
            return Err("max_queue_len must be at least 1".to_string());
        }
        Ok(())
    }

    /// Load overrides from a TOML file.
    pub fn load(config_path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: ProtocolConfig =
            toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the override path from a scene file path: `config.toml` in the
    /// same directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        let scene = Path::new(scene_path);
        scene.parent().unwrap_or(Path::new(".")).join("config.toml")
    }
}
