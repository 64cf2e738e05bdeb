//! # pktio-shm
//!
//! Shared-memory building blocks for the pktio packet-I/O layer.
//!
//! This crate provides:
//! - Named shared-memory segments discoverable by peer processes (`segment`)
//! - A fixed-capacity, lock-free MPMC ring of 64-bit descriptors (`ring`)
//! - Packet pools living in an exported segment, and the `Packet` handle (`pool`)
//! - Import of a peer's exported pool and offset resolution (`mapping`)
//!
//! ## Offsets, not pointers
//!
//! Two processes map the same pool at different virtual addresses. Everything
//! that crosses the process boundary is therefore a [`PoolOffset`]: the
//! position of a packet header relative to the start of its pool segment.
//! Turning an offset back into memory always goes through a [`Pool`] (the
//! owner) or a [`RemotePool`] (an importer).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mapping;
pub mod pool;
pub mod ring;
pub mod segment;

pub use error::{ShmError, ShmResult};
pub use mapping::RemotePool;
pub use pool::{
    Packet, PacketHeader, PacketSubtype, ParsedFields, Pool, PoolOffset, PoolParams,
    SharedRegionInfo,
};
pub use ring::{Ring, RingPlacement};
pub use segment::{SHM_NAME_LEN, ShmNamespace, ShmSegment};
