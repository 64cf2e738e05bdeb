//! Error types for packet I/O interfaces

use crate::entry::PktioState;
use pktio_shm::ShmError;
use thiserror::Error;

/// Result alias for packet I/O operations
pub type PktioResult<T> = Result<T, PktioError>;

/// Errors returned by interface operations
#[derive(Debug, Error)]
pub enum PktioError {
    /// Device name is malformed or names no usable device
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// No registered module recognizes the device name
    #[error("No module for device: {0}")]
    NoModule(String),

    /// An interface with this name is already open
    #[error("Interface already open: {0}")]
    AlreadyOpen(String),

    /// Operation not allowed in the current lifecycle state
    #[error("{name}: cannot {op} in state {state}")]
    InvalidState {
        /// Interface name
        name: String,
        /// Attempted operation
        op: &'static str,
        /// State at the time of the call
        state: PktioState,
    },

    /// Queue index beyond the configured queue count
    #[error("Invalid queue index {index} (configured {max})")]
    InvalidQueue {
        /// Requested index
        index: usize,
        /// Number of configured queues
        max: usize,
    },

    /// Backend does not implement the operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Link peer has not completed its side of the handshake
    #[error("Peer not ready: {0}")]
    PeerNotReady(String),

    /// NIC driver failure
    #[error("Driver error: {0}")]
    Driver(String),

    /// First packet of a send exceeds the interface MTU
    #[error("Packet of {len} bytes exceeds MTU {mtu}")]
    MessageTooLong {
        /// Packet length
        len: usize,
        /// Interface MTU
        mtu: u32,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shared-memory failure
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),
}
