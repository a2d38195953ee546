//! The `config` module contains the [DriverConfig].

use crate::backend::TxPolicy;
use anyhow::{anyhow, Result};
use rollup_challenger_protocol::bisection::ChallengeConfig;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// The [TrackerConfig] struct contains the configuration for the
/// [ChainHeadTracker](crate::ChainHeadTracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How long to wait before fetching a header again.
    pub retry_delay: Duration,
    /// The number of failed fetches of a single header after which tracking stops. Headers that
    /// are not found yet do not count.
    pub max_fetch_attempts: u32,
    /// The capacity of the channel block identities are published into.
    pub buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            max_fetch_attempts: 5,
            buffer: 100,
        }
    }
}

/// The [DriverConfig] struct contains the configuration for the [Driver](crate::Driver)
/// implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// The configuration of every chain head tracker.
    pub tracker: TrackerConfig,
    /// The parameters of the challenges the drivers take part in.
    pub challenge: ChallengeConfig,
    /// The options every submitted transaction is built from.
    pub tx_policy: TxPolicy,
    /// The capacity of the channel decoded events are published into.
    pub event_buffer: usize,
    /// How many blocks below a reorged block the head tracker restarts from.
    pub reorg_rollback_depth: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            challenge: ChallengeConfig::default(),
            tx_policy: TxPolicy::default(),
            event_buffer: 100,
            reorg_rollback_depth: 6,
        }
    }
}

impl DriverConfig {
    /// Reads a [DriverConfig] from a JSON file. Missing fields take their default value.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.challenge.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{"challenge": {"fan_out": 4, "timeout_window": 30}}"#)
                .unwrap();
        assert_eq!(config.challenge.fan_out, 4);
        assert_eq!(config.tracker, TrackerConfig::default());
        assert_eq!(config.reorg_rollback_depth, 6);
    }
}
