//! # pktio
//!
//! Uniform packet I/O over interchangeable transports.
//!
//! This crate provides:
//! - The operations contract every backend implements (`ops`)
//! - Interface entries with lifecycle, queue locks and generic statistics (`entry`, `lock`)
//! - The interface registry that picks a backend by device name (`registry`)
//! - A loopback backend (`loopback`)
//! - A NIC driver backend with a virtual NIC for tests and tooling (`driver`)
//! - A shared-memory link between two processes (`ipc`)
//! - A receive-side classification hook (`classify`)
//!
//! ## Example
//!
//! ```no_run
//! use pktio::{PktioParam, PktioRegistry, PktioSubsystemConfig};
//! use pktio_shm::{Pool, PoolParams};
//!
//! let registry = PktioRegistry::new(PktioSubsystemConfig::default())?;
//! let pool = Pool::create(registry.namespace(), &PoolParams::new("pool0", 1024, 2048))?;
//! let entry = registry.open("loop", &pool, PktioParam::default())?;
//! entry.start()?;
//!
//! let mut pkts = vec![pool.alloc_copy(&[0u8; 64]).unwrap()];
//! entry.send(0, &mut pkts)?;
//! let mut out = Vec::new();
//! entry.recv(0, &mut out, 8)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Contract and generic layer
pub mod entry;
pub mod error;
pub mod lock;
pub mod ops;
pub mod registry;

pub mod classify;
pub mod config;

// Backends
pub mod driver;
pub mod ipc;
pub mod loopback;

pub use classify::{Classification, Classifier, ClassifyError, ParserClassifier};
pub use config::{IpcConfig, LoopbackConfig, PktioSubsystemConfig};
pub use driver::{NicDriver, NicInfo, VirtualNic};
pub use entry::{EntryCore, PktioEntry, PktioHandle, PktioState, PktioStats};
pub use error::{PktioError, PktioResult};
pub use ops::{
    BackendKind, Capability, HashProto, LinkStatus, MacAddr, OpMode, PktinConfigOpt, PktinMode,
    PktinQueueParam, PktioConfig, PktioModule, PktioOps, PktioParam, PktoutMode,
    PktoutQueueParam, SetOps, StatsSnapshot,
};
pub use registry::{PktioRegistry, PktioRegistryBuilder};
