//! Handshake block shared by the two ends of a link.
//!
//! The master reserves `<dev>_info`; the slave imports it by name and master
//! pid. Each side owns one [`PeerRecord`]: it fills in its pool description
//! and sets `init_done` last, with release ordering, so a peer that observes
//! `init_done` also observes the record contents.

use crate::error::{PktioError, PktioResult};
use pktio_shm::{SHM_NAME_LEN, SharedRegionInfo, ShmError, ShmNamespace, ShmSegment};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

const INFO_MAGIC: u64 = 0x7066_6b74_696e_666f; // "pktinfo"

/// Suffix of the handshake block name
pub const INFO_SUFFIX: &str = "_info";

/// One side's published state
#[repr(C)]
pub struct PeerRecord {
    init_done: AtomicU32,
    pid: AtomicU32,
    block_size: AtomicU32,
    name_len: AtomicU32,
    base_addr: AtomicU64,
    pool_name: [AtomicU8; SHM_NAME_LEN],
}

/// Plain copy of a [`PeerRecord`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Side finished its part of the handshake
    pub init_done: bool,
    /// Exported pool name
    pub pool_name: String,
    /// Owning process
    pub pid: u32,
    /// Pool base address in the owner's address space
    pub base_addr: u64,
    /// Pool block size
    pub block_size: u32,
}

impl PeerRecord {
    /// True once the side has published its pool
    pub fn is_ready(&self) -> bool {
        self.init_done.load(Ordering::Acquire) != 0
    }

    /// Publish `pool` as owned by `pid`, then mark the record done
    pub fn publish(&self, pool: &SharedRegionInfo, pid: u32) -> PktioResult<()> {
        let name = pool.name.as_bytes();
        if name.len() > SHM_NAME_LEN {
            return Err(PktioError::Shm(ShmError::NameTooLong {
                name: pool.name.clone(),
                max: SHM_NAME_LEN,
            }));
        }
        for (slot, byte) in self
            .pool_name
            .iter()
            .zip(name.iter().copied().chain(std::iter::repeat(0)))
        {
            slot.store(byte, Ordering::Relaxed);
        }
        self.name_len.store(name.len() as u32, Ordering::Relaxed);
        self.pid.store(pid, Ordering::Relaxed);
        self.block_size.store(pool.block_size, Ordering::Relaxed);
        self.base_addr.store(pool.base_addr, Ordering::Relaxed);
        self.init_done.store(1, Ordering::Release);
        Ok(())
    }

    /// Withdraw the record
    pub fn clear(&self) {
        self.init_done.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Relaxed);
        self.base_addr.store(0, Ordering::Relaxed);
        self.block_size.store(0, Ordering::Relaxed);
        self.name_len.store(0, Ordering::Relaxed);
    }

    /// Exported pool name
    pub fn pool_name(&self) -> String {
        let len = (self.name_len.load(Ordering::Relaxed) as usize).min(SHM_NAME_LEN);
        let bytes: Vec<u8> = self.pool_name[..len]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Owning process
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// Current contents
    pub fn snapshot(&self) -> PeerSnapshot {
        let init_done = self.is_ready();
        PeerSnapshot {
            init_done,
            pool_name: self.pool_name(),
            pid: self.pid(),
            base_addr: self.base_addr.load(Ordering::Relaxed),
            block_size: self.block_size.load(Ordering::Relaxed),
        }
    }
}

#[repr(C)]
struct PktioInfo {
    magic: AtomicU64,
    master: PeerRecord,
    slave: PeerRecord,
}

/// Both records of a link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcInfoSnapshot {
    /// Master side
    pub master: PeerSnapshot,
    /// Slave side
    pub slave: PeerSnapshot,
}

/// Mapped handshake block
#[derive(Debug)]
pub struct InfoBlock {
    segment: ShmSegment,
}

impl InfoBlock {
    /// Name of the block for link `dev`
    pub fn object_name(dev: &str) -> String {
        format!("{dev}{INFO_SUFFIX}")
    }

    /// Reserve the block for `dev` (master side)
    pub fn create(ns: &ShmNamespace, dev: &str) -> PktioResult<Self> {
        let segment =
            ShmSegment::reserve(ns, &Self::object_name(dev), std::mem::size_of::<PktioInfo>())?;
        let block = Self { segment };
        block.info().magic.store(INFO_MAGIC, Ordering::Release);
        Ok(block)
    }

    /// Map the block of `dev` reserved by process `pid` (slave side)
    pub fn import(ns: &ShmNamespace, dev: &str, pid: u32) -> PktioResult<Self> {
        let name = Self::object_name(dev);
        let segment = ShmSegment::import(ns, &name, pid)?;
        if segment.len() < std::mem::size_of::<PktioInfo>() {
            return Err(PktioError::Shm(ShmError::BadLayout {
                name,
                reason: format!("{} bytes", segment.len()),
            }));
        }
        let block = Self { segment };
        let magic = block.info().magic.load(Ordering::Acquire);
        if magic != INFO_MAGIC {
            return Err(PktioError::Shm(ShmError::BadLayout {
                name,
                reason: format!("magic {magic:#x}"),
            }));
        }
        Ok(block)
    }

    /// Remove the block of `dev` created by this process
    pub fn unlink(ns: &ShmNamespace, dev: &str) -> PktioResult<bool> {
        Ok(ShmSegment::unlink(ns, &Self::object_name(dev))?)
    }

    fn info(&self) -> &PktioInfo {
        // SAFETY: the mapping holds at least one PktioInfo (checked or sized
        // at creation) and is page aligned; all fields are atomics.
        unsafe { &*(self.segment.as_ptr() as *const PktioInfo) }
    }

    /// Master record
    pub fn master(&self) -> &PeerRecord {
        &self.info().master
    }

    /// Slave record
    pub fn slave(&self) -> &PeerRecord {
        &self.info().slave
    }

    /// Both records
    pub fn snapshot(&self) -> IpcInfoSnapshot {
        IpcInfoSnapshot {
            master: self.master().snapshot(),
            slave: self.slave().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktio_shm::segment::current_pid;

    fn region(name: &str) -> SharedRegionInfo {
        SharedRegionInfo {
            name: name.to_string(),
            base_addr: 0x7f00_0000_0000,
            block_size: 2304,
        }
    }

    #[test]
    fn test_publish_visible_to_importer() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let master = InfoBlock::create(&ns, "ipc:t0").unwrap();
        let slave = InfoBlock::import(&ns, "ipc:t0", current_pid()).unwrap();
        assert!(!slave.master().is_ready());

        master.master().publish(&region("pool_a"), 42).unwrap();
        let snap = slave.snapshot();
        assert!(snap.master.init_done);
        assert_eq!(snap.master.pool_name, "pool_a");
        assert_eq!(snap.master.pid, 42);
        assert_eq!(snap.master.block_size, 2304);
        assert_eq!(snap.master.base_addr, 0x7f00_0000_0000);
        assert!(!snap.slave.init_done);

        slave.slave().publish(&region("pool_b"), 7).unwrap();
        assert!(master.slave().is_ready());
        assert_eq!(master.slave().pool_name(), "pool_b");

        master.slave().clear();
        assert_eq!(slave.slave().snapshot(), PeerSnapshot::default());
    }

    #[test]
    fn test_shorter_name_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let block = InfoBlock::create(&ns, "ipc:t1").unwrap();
        block.master().publish(&region("a_long_pool_name"), 1).unwrap();
        block.master().publish(&region("short"), 1).unwrap();
        assert_eq!(block.master().pool_name(), "short");
    }

    #[test]
    fn test_import_missing_or_foreign() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        assert!(matches!(
            InfoBlock::import(&ns, "ipc:none", current_pid()),
            Err(PktioError::Shm(ShmError::NotFound { .. }))
        ));

        let _other = ShmSegment::reserve(&ns, "ipc:junk_info", 4096).unwrap();
        assert!(matches!(
            InfoBlock::import(&ns, "ipc:junk", current_pid()),
            Err(PktioError::Shm(ShmError::BadLayout { .. }))
        ));
    }

    #[test]
    fn test_create_is_exclusive_and_unlink_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let _block = InfoBlock::create(&ns, "ipc:t2").unwrap();
        assert!(InfoBlock::create(&ns, "ipc:t2").is_err());
        assert!(InfoBlock::unlink(&ns, "ipc:t2").unwrap());
        assert!(!InfoBlock::unlink(&ns, "ipc:t2").unwrap());
    }
}
