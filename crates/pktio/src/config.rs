//! Subsystem configuration.
//!
//! Plain structs with serde defaults so a partial TOML file fills in the
//! rest. Call [`PktioSubsystemConfig::validate`] before use.

use crate::error::{PktioError, PktioResult};
use pktio_shm::ShmNamespace;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default per-interface queue limit
pub const PKTIO_MAX_QUEUES: usize = 64;

/// Default descriptor ring size of an IPC link
pub const PKTIO_IPC_ENTRIES: usize = 4096;

/// Configuration of the packet I/O subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PktioSubsystemConfig {
    /// Directory holding shared-memory objects (`/dev/shm` or the temp dir
    /// when unset)
    pub shm_dir: Option<PathBuf>,

    /// Maximum number of input or output queues per interface
    pub max_queues: usize,

    /// IPC backend settings
    pub ipc: IpcConfig,

    /// Loopback backend settings
    pub loopback: LoopbackConfig,
}

impl Default for PktioSubsystemConfig {
    fn default() -> Self {
        Self {
            shm_dir: None,
            max_queues: PKTIO_MAX_QUEUES,
            ipc: IpcConfig::default(),
            loopback: LoopbackConfig::default(),
        }
    }
}

impl PktioSubsystemConfig {
    /// Validate all sections
    pub fn validate(&self) -> PktioResult<()> {
        if self.max_queues == 0 {
            return Err(PktioError::InvalidConfig(
                "max_queues must be > 0".to_string(),
            ));
        }
        self.ipc.validate()?;
        self.loopback.validate()?;
        Ok(())
    }

    /// Namespace selected by `shm_dir`
    pub fn namespace(&self) -> ShmNamespace {
        match &self.shm_dir {
            Some(dir) => ShmNamespace::new(dir),
            None => ShmNamespace::system(),
        }
    }
}

/// IPC backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Capacity of each link ring (power of two)
    pub ring_entries: usize,

    /// Delay between draining the send ring and the free ring at stop,
    /// giving the peer time to finish in-flight transfers
    pub stop_grace_ms: u64,

    /// Give up returning descriptors to a full peer free ring after this
    /// long and retry them at the next receive. `None` retries until the
    /// peer drains the ring.
    pub free_ring_deadline_ms: Option<u64>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ring_entries: PKTIO_IPC_ENTRIES,
            stop_grace_ms: 1000,
            free_ring_deadline_ms: None,
        }
    }
}

impl IpcConfig {
    /// Validate IPC settings
    pub fn validate(&self) -> PktioResult<()> {
        if self.ring_entries < 2 || !self.ring_entries.is_power_of_two() {
            return Err(PktioError::InvalidConfig(format!(
                "ipc.ring_entries must be a power of two >= 2, got {}",
                self.ring_entries
            )));
        }
        if self.ring_entries > pktio_shm::ring::RING_MAX_CAPACITY {
            return Err(PktioError::InvalidConfig(format!(
                "ipc.ring_entries too large: {}",
                self.ring_entries
            )));
        }
        Ok(())
    }
}

/// Loopback backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Capacity of the loop queue in packets
    pub queue_size: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self { queue_size: 4096 }
    }
}

impl LoopbackConfig {
    /// Validate loopback settings
    pub fn validate(&self) -> PktioResult<()> {
        if self.queue_size == 0 {
            return Err(PktioError::InvalidConfig(
                "loopback.queue_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PktioSubsystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ipc.ring_entries, 4096);
        assert_eq!(config.max_queues, 64);
        assert!(config.ipc.free_ring_deadline_ms.is_none());
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let mut config = PktioSubsystemConfig::default();
        config.ipc.ring_entries = 1000;
        assert!(matches!(
            config.validate(),
            Err(PktioError::InvalidConfig(_))
        ));
        config.ipc.ring_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let mut config = PktioSubsystemConfig::default();
        config.loopback.queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = PktioSubsystemConfig::default();
        config.max_queues = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: PktioSubsystemConfig = toml::from_str(
            r#"
            shm_dir = "/tmp/pktio"

            [ipc]
            stop_grace_ms = 10
            free_ring_deadline_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.shm_dir, Some(PathBuf::from("/tmp/pktio")));
        assert_eq!(config.ipc.stop_grace_ms, 10);
        assert_eq!(config.ipc.free_ring_deadline_ms, Some(250));
        assert_eq!(config.ipc.ring_entries, PKTIO_IPC_ENTRIES);
        assert_eq!(config.loopback.queue_size, 4096);
        assert_eq!(config.namespace().dir(), std::path::Path::new("/tmp/pktio"));
    }
}
