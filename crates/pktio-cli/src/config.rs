//! Configuration file of the `pktio` tool

use anyhow::Context;
use pktio::PktioSubsystemConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Packet I/O subsystem settings
    pub pktio: PktioSubsystemConfig,
    /// Tool settings
    pub run: RunConfig,
}

/// Settings of the traffic commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Blocks in the pool each command creates
    pub pool_blocks: u32,
    /// Idle wait between polls
    pub poll_interval_us: u64,
    /// Give up waiting for the peer after this long
    pub peer_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_blocks: 1024,
            poll_interval_us: 100,
            peer_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pktio.validate()?;
        if self.run.pool_blocks == 0 {
            anyhow::bail!("run.pool_blocks must be > 0");
        }
        // more blocks than ring slots can fill the peer's free ring
        if self.run.pool_blocks as usize > self.pktio.ipc.ring_entries {
            anyhow::bail!(
                "run.pool_blocks ({}) must not exceed pktio.ipc.ring_entries ({})",
                self.run.pool_blocks,
                self.pktio.ipc.ring_entries
            );
        }
        Ok(())
    }
}
