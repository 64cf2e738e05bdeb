//! Packet pools in exported shared memory.
//!
//! A pool is one named shared-memory object: a small pool header followed
//! by `num` equally sized blocks. Every block starts with a [`PacketHeader`]
//! and continues with a data area of `headroom + seg_len` bytes. Because the
//! whole pool is a single named object, a peer process can import it
//! ([`crate::RemotePool`]) and resolve any [`PoolOffset`] it is handed.
//!
//! Allocation state (the free list) is process-local: only the owning process
//! allocates from or frees into a pool. Peers hand blocks back by returning
//! their offsets through a free ring, and the owner calls [`Pool::reclaim`].

use crate::error::{ShmError, ShmResult};
use crate::segment::{ShmNamespace, ShmSegment};
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub(crate) const POOL_MAGIC: u64 = 0x7066_6b74_706f_6f6c; // "pktpool"
pub(crate) const BLOCK_ALIGN: usize = 64;

/// Default headroom reserved in front of every payload
pub const DEFAULT_HEADROOM: u32 = 128;

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Pool-relative position of a packet header.
///
/// This is the only packet representation that crosses a process boundary.
/// Turning it back into memory needs the owning [`Pool`] or an imported
/// [`crate::RemotePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolOffset(u64);

impl PoolOffset {
    /// Wrap a raw descriptor value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw descriptor value
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<PoolOffset> for u64 {
    fn from(offset: PoolOffset) -> Self {
        offset.0
    }
}

impl fmt::Display for PoolOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Packet subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PacketSubtype {
    /// Plain packet
    #[default]
    Basic = 0,
    /// Packet carrying IPsec processing results
    Ipsec = 1,
}

impl PacketSubtype {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Ipsec,
            _ => Self::Basic,
        }
    }
}

/// Header fields produced by classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ParsedFields {
    /// Offset of the L2 header within the frame
    pub l2_offset: u16,
    /// Offset of the L3 header within the frame
    pub l3_offset: u16,
    /// Offset of the L4 header within the frame
    pub l4_offset: u16,
    /// Reserved
    pub _reserved: u16,
    /// Protocol flags (`ParsedFields::HAS_*`)
    pub flags: u32,
    /// Flow hash
    pub flow_hash: u32,
}

impl ParsedFields {
    /// Ethernet header present
    pub const HAS_ETH: u32 = 1 << 0;
    /// IPv4 header present
    pub const HAS_IPV4: u32 = 1 << 1;
    /// IPv6 header present
    pub const HAS_IPV6: u32 = 1 << 2;
    /// UDP header present
    pub const HAS_UDP: u32 = 1 << 3;
    /// TCP header present
    pub const HAS_TCP: u32 = 1 << 4;
    /// Classification produced an error flag
    pub const HAS_ERROR: u32 = 1 << 31;
}

/// Metadata at the start of every pool block
#[derive(Debug)]
#[repr(C)]
pub struct PacketHeader {
    refs: AtomicU32,
    frame_len: u32,
    headroom: u32,
    tailroom: u32,
    data_offset: u64,
    timestamp_ns: u64,
    parsed: ParsedFields,
    subtype: u8,
    has_timestamp: u8,
    _pad: [u8; 6],
}

impl PacketHeader {
    /// Payload length in bytes
    pub fn frame_len(&self) -> u32 {
        self.frame_len
    }

    /// Bytes available in front of the payload
    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    /// Bytes available after the payload
    pub fn tailroom(&self) -> u32 {
        self.tailroom
    }

    /// Pool-relative position of the first payload byte
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Receive timestamp, if one was recorded
    pub fn timestamp_ns(&self) -> Option<u64> {
        (self.has_timestamp != 0).then_some(self.timestamp_ns)
    }

    /// Classification results
    pub fn parsed(&self) -> ParsedFields {
        self.parsed
    }

    /// Packet subtype
    pub fn subtype(&self) -> PacketSubtype {
        PacketSubtype::from_raw(self.subtype)
    }

    /// Number of handles referring to this block
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

#[repr(C)]
pub(crate) struct PoolHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) num: u32,
    pub(crate) block_size: u32,
    pub(crate) hdr_size: u32,
    pub(crate) buf_len: u32,
    pub(crate) headroom: u32,
    pub(crate) blocks_offset: u32,
}

pub(crate) const PACKET_HDR_SIZE: usize = align_up(std::mem::size_of::<PacketHeader>(), BLOCK_ALIGN);
pub(crate) const POOL_HDR_SIZE: usize = align_up(std::mem::size_of::<PoolHeader>(), BLOCK_ALIGN);

/// Pool creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    /// Pool name, also the name of its shared-memory object
    pub name: String,
    /// Number of packets
    pub num: u32,
    /// Maximum payload length per packet
    pub seg_len: u32,
    /// Headroom reserved in front of each payload
    pub headroom: u32,
}

impl PoolParams {
    /// Parameters with the default headroom
    pub fn new(name: impl Into<String>, num: u32, seg_len: u32) -> Self {
        Self {
            name: name.into(),
            num,
            seg_len,
            headroom: DEFAULT_HEADROOM,
        }
    }

    /// Validate the parameters
    pub fn validate(&self) -> ShmResult<()> {
        if self.num == 0 {
            return Err(ShmError::InvalidConfig(format!(
                "pool {}: num must be > 0",
                self.name
            )));
        }
        if self.seg_len == 0 {
            return Err(ShmError::InvalidConfig(format!(
                "pool {}: seg_len must be > 0",
                self.name
            )));
        }
        let block = PACKET_HDR_SIZE as u64 + self.headroom as u64 + self.seg_len as u64;
        if block > u32::MAX as u64 {
            return Err(ShmError::InvalidConfig(format!(
                "pool {}: block of {block} bytes too large",
                self.name
            )));
        }
        if self.segment_size().is_none() {
            return Err(ShmError::InvalidConfig(format!(
                "pool {}: {} blocks of {block} bytes overflow the address space",
                self.name, self.num
            )));
        }
        Ok(())
    }

    fn block_size(&self) -> usize {
        align_up(
            PACKET_HDR_SIZE + self.headroom as usize + self.seg_len as usize,
            BLOCK_ALIGN,
        )
    }

    /// Size of the shared object holding the pool, `None` when it cannot
    /// be mapped
    fn segment_size(&self) -> Option<usize> {
        self.block_size()
            .checked_mul(self.num as usize)?
            .checked_add(POOL_HDR_SIZE)
            .filter(|&size| size <= isize::MAX as usize)
    }
}

/// What a peer needs to import a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRegionInfo {
    /// Shared object name
    pub name: String,
    /// Base address of the exporter's mapping (informational)
    pub base_addr: u64,
    /// Size of one pool block
    pub block_size: u32,
}

struct PoolInner {
    name: String,
    ns: ShmNamespace,
    segment: ShmSegment,
    free: ArrayQueue<u64>,
    num: u32,
    block_size: u32,
    buf_len: u32,
    headroom: u32,
    blocks_offset: u64,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Err(e) = ShmSegment::unlink(&self.ns, &self.name) {
            tracing::warn!("Failed to unlink pool {}: {}", self.name, e);
        }
    }
}

/// Shared-memory packet pool owned by this process
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool and export it under `params.name` in `ns`
    pub fn create(ns: &ShmNamespace, params: &PoolParams) -> ShmResult<Self> {
        params.validate()?;

        let buf_len = params.headroom + params.seg_len;
        let block_size = params.block_size();
        let size = params.segment_size().ok_or_else(|| {
            ShmError::InvalidConfig(format!("pool {}: size overflow", params.name))
        })?;
        let segment = ShmSegment::reserve(ns, &params.name, size)?;

        let header = segment.as_ptr() as *mut PoolHeader;
        // SAFETY: the segment is at least POOL_HDR_SIZE bytes and not yet
        // visible through any other handle of this process.
        unsafe {
            (*header).num = params.num;
            (*header).block_size = block_size as u32;
            (*header).hdr_size = PACKET_HDR_SIZE as u32;
            (*header).buf_len = buf_len;
            (*header).headroom = params.headroom;
            (*header).blocks_offset = POOL_HDR_SIZE as u32;
            (*header).magic.store(POOL_MAGIC, Ordering::Release);
        }

        let free = ArrayQueue::new(params.num as usize);
        for i in 0..params.num as u64 {
            // cannot fail, the queue holds exactly `num` entries
            let _ = free.push(POOL_HDR_SIZE as u64 + i * block_size as u64);
        }

        tracing::debug!(
            "Created pool {} ({} x {} bytes, headroom {})",
            params.name,
            params.num,
            block_size,
            params.headroom
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                name: params.name.clone(),
                ns: ns.clone(),
                segment,
                free,
                num: params.num,
                block_size: block_size as u32,
                buf_len,
                headroom: params.headroom,
                blocks_offset: POOL_HDR_SIZE as u64,
            }),
        })
    }

    /// Allocate a packet of `len` bytes with the default headroom
    pub fn alloc(&self, len: u32) -> Option<Packet> {
        self.alloc_with_headroom(len, self.inner.headroom)
    }

    /// Allocate a packet of `len` bytes with `headroom` bytes in front.
    ///
    /// Returns `None` when the pool is exhausted or the block cannot hold the
    /// requested layout.
    pub fn alloc_with_headroom(&self, len: u32, headroom: u32) -> Option<Packet> {
        if headroom as u64 + len as u64 > self.inner.buf_len as u64 {
            return None;
        }
        let offset = self.inner.free.pop()?;

        let header = self.header_ptr(offset);
        // SAFETY: the block came off the free list, so no other handle refers
        // to it; the header lies within the mapping.
        unsafe {
            header.write(PacketHeader {
                refs: AtomicU32::new(1),
                frame_len: len,
                headroom,
                tailroom: self.inner.buf_len - headroom - len,
                data_offset: offset + PACKET_HDR_SIZE as u64 + headroom as u64,
                timestamp_ns: 0,
                parsed: ParsedFields::default(),
                subtype: PacketSubtype::Basic as u8,
                has_timestamp: 0,
                _pad: [0; 6],
            });
        }

        Some(Packet {
            pool: self.clone(),
            offset: PoolOffset(offset),
        })
    }

    /// Allocate a packet holding a copy of `bytes`
    pub fn alloc_copy(&self, bytes: &[u8]) -> Option<Packet> {
        let len = u32::try_from(bytes.len()).ok()?;
        let mut pkt = self.alloc(len)?;
        pkt.data_mut().copy_from_slice(bytes);
        Some(pkt)
    }

    /// Take back a block whose ownership was handed out with
    /// [`Packet::into_offset`], releasing one reference
    pub fn reclaim(&self, offset: PoolOffset) -> ShmResult<()> {
        drop(self.packet_from_offset(offset)?);
        Ok(())
    }

    /// Rebuild the packet handle for a block handed out with
    /// [`Packet::into_offset`]
    pub fn packet_from_offset(&self, offset: PoolOffset) -> ShmResult<Packet> {
        self.check_offset(offset)?;
        Ok(Packet {
            pool: self.clone(),
            offset,
        })
    }

    /// Verify that `offset` addresses a block header of this pool
    pub fn check_offset(&self, offset: PoolOffset) -> ShmResult<()> {
        let raw = offset.get();
        let inner = &self.inner;
        let end = inner.blocks_offset + inner.num as u64 * inner.block_size as u64;
        if raw < inner.blocks_offset
            || raw >= end
            || (raw - inner.blocks_offset) % inner.block_size as u64 != 0
        {
            return Err(ShmError::OffsetOutOfRange {
                offset: raw,
                size: inner.segment.len(),
            });
        }
        Ok(())
    }

    fn header_ptr(&self, offset: u64) -> *mut PacketHeader {
        // SAFETY: callers pass block offsets of this pool, which are within
        // the mapping and 64-byte aligned.
        unsafe { self.inner.segment.as_ptr().add(offset as usize) as *mut PacketHeader }
    }

    fn free_block(&self, offset: u64) {
        if self.inner.free.push(offset).is_err() {
            // more frees than blocks means a block was freed twice
            panic!("pool {}: free list overflow at {:#x}", self.inner.name, offset);
        }
    }

    /// Describe the exported region for peers
    pub fn describe(&self) -> SharedRegionInfo {
        SharedRegionInfo {
            name: self.inner.name.clone(),
            base_addr: self.base_addr(),
            block_size: self.inner.block_size,
        }
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Namespace the pool is exported in
    pub fn namespace(&self) -> &ShmNamespace {
        &self.inner.ns
    }

    /// Address of the local mapping
    pub fn base_addr(&self) -> u64 {
        self.inner.segment.as_ptr() as u64
    }

    /// Size of one block
    pub fn block_size(&self) -> u32 {
        self.inner.block_size
    }

    /// Data area size of one block (headroom + seg_len)
    pub fn buf_len(&self) -> u32 {
        self.inner.buf_len
    }

    /// Default headroom
    pub fn headroom(&self) -> u32 {
        self.inner.headroom
    }

    /// Maximum payload length with the default headroom
    pub fn seg_len(&self) -> u32 {
        self.inner.buf_len - self.inner.headroom
    }

    /// Number of free blocks
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Total number of blocks
    pub fn capacity(&self) -> usize {
        self.inner.num as usize
    }

    /// True if both handles refer to the same pool
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
impl Pool {
    /// Payload position recorded in the header at `offset`
    pub(crate) fn header_data_offset(&self, offset: PoolOffset) -> u64 {
        // SAFETY: test helper, offset comes from this pool
        unsafe { (*self.header_ptr(offset.get())).data_offset }
    }

    /// Overwrite the payload fields of the header at `offset`, as a
    /// misbehaving peer could
    pub(crate) fn overwrite_layout(&self, offset: PoolOffset, frame_len: u32, data_offset: u64) {
        // SAFETY: test helper, offset comes from this pool and the caller
        // holds no reference into the header
        unsafe {
            let header = self.header_ptr(offset.get());
            (*header).frame_len = frame_len;
            (*header).data_offset = data_offset;
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("num", &self.inner.num)
            .field("block_size", &self.inner.block_size)
            .field("available", &self.available())
            .finish()
    }
}

/// Handle to one packet of a [`Pool`].
///
/// Dropping the handle releases its reference; the block returns to the free
/// list with the last one.
pub struct Packet {
    pool: Pool,
    offset: PoolOffset,
}

impl Packet {
    /// Block header
    pub fn header(&self) -> &PacketHeader {
        // SAFETY: this handle holds a reference to the block, so the header
        // is initialized and stays valid while `self.pool` is alive.
        unsafe { &*self.pool.header_ptr(self.offset.get()) }
    }

    fn header_mut(&mut self) -> &mut PacketHeader {
        assert!(
            !self.has_ref(),
            "pool {}: mutating shared packet {}",
            self.pool.name(),
            self.offset
        );
        // SAFETY: sole reference to the block (checked above)
        unsafe { &mut *self.pool.header_ptr(self.offset.get()) }
    }

    /// Owning pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Pool-relative header position
    pub fn offset(&self) -> PoolOffset {
        self.offset
    }

    /// Pool-relative payload position
    pub fn data_offset(&self) -> u64 {
        self.header().data_offset
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.header().frame_len as usize
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes in front of the payload
    pub fn headroom(&self) -> u32 {
        self.header().headroom
    }

    /// Bytes after the payload
    pub fn tailroom(&self) -> u32 {
        self.header().tailroom
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        let hdr = self.header();
        // SAFETY: data_offset..+frame_len lies inside this block's data area
        unsafe {
            std::slice::from_raw_parts(
                self.pool.inner.segment.as_ptr().add(hdr.data_offset as usize),
                hdr.frame_len as usize,
            )
        }
    }

    /// Mutable payload bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (data_offset, len) = {
            let hdr = self.header_mut();
            (hdr.data_offset, hdr.frame_len)
        };
        // SAFETY: exclusive reference to the block; range inside its data area
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.inner.segment.as_ptr().add(data_offset as usize),
                len as usize,
            )
        }
    }

    /// Packet subtype
    pub fn subtype(&self) -> PacketSubtype {
        self.header().subtype()
    }

    /// Set the packet subtype
    pub fn set_subtype(&mut self, subtype: PacketSubtype) {
        self.header_mut().subtype = subtype as u8;
    }

    /// Receive timestamp
    pub fn timestamp_ns(&self) -> Option<u64> {
        self.header().timestamp_ns()
    }

    /// Record a receive timestamp
    pub fn set_timestamp_ns(&mut self, ts: u64) {
        let hdr = self.header_mut();
        hdr.timestamp_ns = ts;
        hdr.has_timestamp = 1;
    }

    /// Classification results
    pub fn parsed(&self) -> ParsedFields {
        self.header().parsed
    }

    /// Store classification results
    pub fn set_parsed(&mut self, parsed: ParsedFields) {
        self.header_mut().parsed = parsed;
    }

    /// Copy header metadata (timestamp, classification, subtype) from a
    /// header of any pool, local or imported
    pub fn copy_metadata_from(&mut self, src: &PacketHeader) {
        let hdr = self.header_mut();
        hdr.parsed = src.parsed;
        hdr.subtype = src.subtype;
        hdr.timestamp_ns = src.timestamp_ns;
        hdr.has_timestamp = src.has_timestamp;
    }

    /// True when more than one handle refers to this block
    pub fn has_ref(&self) -> bool {
        self.header().refs() > 1
    }

    /// Create another handle to the same block
    pub fn reference(&self) -> Packet {
        self.header().refs.fetch_add(1, Ordering::AcqRel);
        Packet {
            pool: self.pool.clone(),
            offset: self.offset,
        }
    }

    /// Copy this packet into `pool`, keeping its layout where it fits
    pub fn copy_to(&self, pool: &Pool) -> Option<Packet> {
        let len = self.header().frame_len;
        let mut copy = pool
            .alloc_with_headroom(len, self.headroom())
            .or_else(|| pool.alloc(len))?;
        copy.data_mut().copy_from_slice(self.data());
        copy.copy_metadata_from(self.header());
        Some(copy)
    }

    /// Give up this handle without releasing the block; the returned offset
    /// now carries the reference
    pub fn into_offset(self) -> PoolOffset {
        let this = ManuallyDrop::new(self);
        let offset = this.offset;
        // SAFETY: `this` is never used again and its Drop does not run; the
        // pool handle is moved out exactly once.
        drop(unsafe { std::ptr::read(&this.pool) });
        offset
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if self.header().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.free_block(self.offset.get());
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool.name())
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(num: u32, seg_len: u32) -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let pool = Pool::create(&ns, &PoolParams::new("pool", num, seg_len)).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_params_validate() {
        assert!(PoolParams::new("p", 0, 64).validate().is_err());
        assert!(PoolParams::new("p", 4, 0).validate().is_err());
        assert!(PoolParams::new("p", 4, 64).validate().is_ok());

        let huge = PoolParams::new("p", u32::MAX, u32::MAX - DEFAULT_HEADROOM - 4096);
        assert!(matches!(huge.validate(), Err(ShmError::InvalidConfig(_))));
    }

    #[test]
    fn test_alloc_until_exhausted() {
        let (_dir, pool) = pool(4, 256);
        assert_eq!(pool.capacity(), 4);

        let pkts: Vec<_> = (0..4).map(|_| pool.alloc(100).unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc(1).is_none());

        drop(pkts);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_layout() {
        let (_dir, pool) = pool(2, 2048);
        assert_eq!(pool.block_size() as usize % BLOCK_ALIGN, 0);
        assert_eq!(pool.buf_len(), DEFAULT_HEADROOM + 2048);
        assert_eq!(pool.seg_len(), 2048);

        let pkt = pool.alloc(100).unwrap();
        assert_eq!(pkt.len(), 100);
        assert_eq!(pkt.headroom(), DEFAULT_HEADROOM);
        assert_eq!(pkt.tailroom(), 2048 - 100);
        assert_eq!(
            pkt.data_offset(),
            pkt.offset().get() + PACKET_HDR_SIZE as u64 + DEFAULT_HEADROOM as u64
        );
        assert!(pool.check_offset(pkt.offset()).is_ok());
    }

    #[test]
    fn test_alloc_rejects_oversized() {
        let (_dir, pool) = pool(2, 64);
        assert!(pool.alloc(65).is_none());
        let full = pool.alloc_with_headroom(64 + DEFAULT_HEADROOM, 0).unwrap();
        assert_eq!(full.headroom(), 0);
        assert_eq!(full.tailroom(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_payload_roundtrip() {
        let (_dir, pool) = pool(2, 256);
        let pkt = pool.alloc_copy(b"hello pool").unwrap();
        assert_eq!(pkt.data(), b"hello pool");
    }

    #[test]
    fn test_into_offset_and_reclaim() {
        let (_dir, pool) = pool(2, 64);
        let offset = pool.alloc(10).unwrap().into_offset();
        assert_eq!(pool.available(), 1);

        pool.reclaim(offset).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_reclaim_rejects_bad_offset() {
        let (_dir, pool) = pool(2, 64);
        let pkt = pool.alloc(10).unwrap();
        let bad = PoolOffset::new(pkt.offset().get() + 1);
        assert!(matches!(
            pool.reclaim(bad),
            Err(ShmError::OffsetOutOfRange { .. })
        ));
        assert!(pool.reclaim(PoolOffset::new(0)).is_err());
        assert!(pool.reclaim(PoolOffset::new(u64::MAX)).is_err());
    }

    #[test]
    fn test_reference_counting() {
        let (_dir, pool) = pool(2, 64);
        let pkt = pool.alloc_copy(&[7; 16]).unwrap();
        assert!(!pkt.has_ref());

        let other = pkt.reference();
        assert!(pkt.has_ref());
        assert_eq!(other.data(), pkt.data());

        drop(pkt);
        assert_eq!(pool.available(), 1);
        assert!(!other.has_ref());
        drop(other);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    #[should_panic(expected = "mutating shared packet")]
    fn test_mutating_referenced_packet_panics() {
        let (_dir, pool) = pool(2, 64);
        let mut pkt = pool.alloc(16).unwrap();
        let _other = pkt.reference();
        pkt.data_mut()[0] = 1;
    }

    #[test]
    fn test_copy_to_other_pool() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let a = Pool::create(&ns, &PoolParams::new("a", 2, 256)).unwrap();
        let b = Pool::create(&ns, &PoolParams::new("b", 2, 256)).unwrap();

        let mut pkt = a.alloc_copy(b"copy me").unwrap();
        pkt.set_timestamp_ns(42);
        pkt.set_subtype(PacketSubtype::Ipsec);
        let parsed = ParsedFields {
            l3_offset: 14,
            flags: ParsedFields::HAS_ETH | ParsedFields::HAS_IPV4,
            ..Default::default()
        };
        pkt.set_parsed(parsed);

        let copy = pkt.copy_to(&b).unwrap();
        assert!(copy.pool().ptr_eq(&b));
        assert!(!copy.pool().ptr_eq(&a));
        assert_eq!(copy.data(), b"copy me");
        assert_eq!(copy.timestamp_ns(), Some(42));
        assert_eq!(copy.subtype(), PacketSubtype::Ipsec);
        assert_eq!(copy.parsed(), parsed);
        assert_eq!(b.available(), 1);
    }

    #[test]
    fn test_pool_unlinked_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let pool = Pool::create(&ns, &PoolParams::new("gone", 2, 64)).unwrap();
        let path = ns.object_path("gone", crate::segment::current_pid());
        assert!(path.exists());

        let pkt = pool.alloc(1).unwrap();
        drop(pool);
        // packets keep the pool alive
        assert!(path.exists());
        drop(pkt);
        assert!(!path.exists());
    }

    #[test]
    fn test_describe() {
        let (_dir, pool) = pool(2, 64);
        let info = pool.describe();
        assert_eq!(info.name, "pool");
        assert_eq!(info.base_addr, pool.base_addr());
        assert_eq!(info.block_size, pool.block_size());
    }
}
