//! Import of a peer's exported packet pool.
//!
//! The peer publishes its pool name and pid; [`RemotePool::import`] maps the
//! same object into this process. A [`PoolOffset`] received from the peer is
//! resolved as `local mapping base + offset`, after checking that it names a
//! block header of that pool.

use crate::error::{ShmError, ShmResult};
use crate::pool::{PACKET_HDR_SIZE, PacketHeader, POOL_MAGIC, PoolHeader, PoolOffset};
use crate::segment::{ShmNamespace, ShmSegment};
use std::sync::atomic::Ordering;

/// A peer process's pool mapped into this process
#[derive(Debug)]
pub struct RemotePool {
    segment: ShmSegment,
    num: u32,
    block_size: u32,
    blocks_offset: u64,
}

impl RemotePool {
    /// Map the pool `name` exported by process `pid`
    pub fn import(ns: &ShmNamespace, name: &str, pid: u32) -> ShmResult<Self> {
        let segment = ShmSegment::import(ns, name, pid)?;
        let bad = |reason: String| ShmError::BadLayout {
            name: name.to_string(),
            reason,
        };

        if segment.len() < std::mem::size_of::<PoolHeader>() {
            return Err(bad(format!("segment too small ({} bytes)", segment.len())));
        }

        let header = segment.as_ptr() as *const PoolHeader;
        // SAFETY: the mapping holds at least a full pool header
        let (magic, num, block_size, hdr_size, buf_len, blocks_offset) = unsafe {
            (
                (*header).magic.load(Ordering::Acquire),
                (*header).num,
                (*header).block_size,
                (*header).hdr_size,
                (*header).buf_len,
                (*header).blocks_offset as u64,
            )
        };

        if magic != POOL_MAGIC {
            return Err(bad(format!("magic {magic:#x}")));
        }
        if hdr_size as usize != PACKET_HDR_SIZE {
            return Err(bad(format!("packet header size {hdr_size}")));
        }
        if block_size == 0 || (hdr_size as u64 + buf_len as u64) > block_size as u64 {
            return Err(bad(format!(
                "block size {block_size} for buffer of {buf_len} bytes"
            )));
        }
        let end = blocks_offset + num as u64 * block_size as u64;
        if end > segment.len() as u64 {
            return Err(bad(format!(
                "{} blocks of {} bytes exceed mapping of {} bytes",
                num,
                block_size,
                segment.len()
            )));
        }

        tracing::debug!(
            "Imported pool {} of pid {} at {:p} ({} x {} bytes)",
            name,
            pid,
            segment.as_ptr(),
            num,
            block_size
        );

        Ok(Self {
            segment,
            num,
            block_size,
            blocks_offset,
        })
    }

    fn check_block(&self, raw: u64) -> ShmResult<()> {
        let end = self.blocks_offset + self.num as u64 * self.block_size as u64;
        if raw < self.blocks_offset
            || raw >= end
            || (raw - self.blocks_offset) % self.block_size as u64 != 0
        {
            return Err(ShmError::OffsetOutOfRange {
                offset: raw,
                size: self.segment.len(),
            });
        }
        Ok(())
    }

    /// Resolve a peer-relative offset to the packet header it names
    pub fn header(&self, offset: PoolOffset) -> ShmResult<&PacketHeader> {
        let raw = offset.get();
        self.check_block(raw)?;
        // SAFETY: offset is a block boundary inside the mapping; blocks are
        // 64-byte aligned so the header reference is well aligned.
        Ok(unsafe { &*(self.segment.as_ptr().add(raw as usize) as *const PacketHeader) })
    }

    /// Payload bytes of a header resolved from this pool.
    ///
    /// The header fields are written by the peer, so the payload range must
    /// lie within the data area of the header's own block.
    pub fn payload(&self, header: &PacketHeader) -> ShmResult<&[u8]> {
        let block = (header as *const PacketHeader as u64).wrapping_sub(self.base_addr());
        self.check_block(block)?;

        let start = header.data_offset();
        let len = header.frame_len() as u64;
        let data_start = block + PACKET_HDR_SIZE as u64;
        let block_end = block + self.block_size as u64;
        match start.checked_add(len) {
            Some(end) if start >= data_start && end <= block_end => {}
            _ => {
                return Err(ShmError::OffsetOutOfRange {
                    offset: start,
                    size: self.segment.len(),
                });
            }
        }
        // SAFETY: the range lies inside one block of the mapping
        Ok(unsafe {
            std::slice::from_raw_parts(self.segment.as_ptr().add(start as usize), len as usize)
        })
    }

    /// Base address of the local mapping
    pub fn base_addr(&self) -> u64 {
        self.segment.as_ptr() as u64
    }

    /// Block size reported by the exporter
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of blocks in the pool
    pub fn capacity(&self) -> usize {
        self.num as usize
    }

    /// Pool name
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Exporting process
    pub fn owner_pid(&self) -> u32 {
        self.segment.owner_pid()
    }
}
