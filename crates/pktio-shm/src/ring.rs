//! Lock-free multi-producer/multi-consumer descriptor ring.
//!
//! The ring stores 64-bit descriptors in a power-of-two slot array. Producers
//! and consumers each own a `{head, tail}` pair of free-running 32-bit
//! counters: `head` is claimed with a CAS, slots are filled (or read), and
//! `tail` is published once every earlier claimant on the same side has
//! published. Occupancy is always `prod.tail - cons.tail`; there is no
//! separate count field.
//!
//! A ring is either process-local or placed in a named shared-memory object
//! that a peer maps with [`Ring::lookup_or_import`]. Both placements use the
//! same layout and algorithm.

use crate::error::{ShmError, ShmResult};
use crate::segment::{ShmNamespace, ShmSegment, check_name};
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const RING_MAGIC: u64 = 0x7066_6b74_7269_6e67; // "pktring"
const CACHE_LINE: usize = 64;

/// Largest supported capacity
pub const RING_MAX_CAPACITY: usize = 1 << 31;

/// Where a ring's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPlacement {
    /// Process-local memory; the name is only a label
    Local,
    /// Named shared-memory object visible to peer processes
    Shared,
}

#[repr(C, align(64))]
struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
}

#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    capacity: u32,
    mask: u32,
    prod: HeadTail,
    cons: HeadTail,
}

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; CACHE_LINE]);

// Storage is only held to keep `header`/`slots` valid
enum Backing {
    Local(#[allow(dead_code)] Box<[CacheLine]>),
    Shared(#[allow(dead_code)] ShmSegment),
}

/// Bounded MPMC queue of 64-bit descriptors
pub struct Ring {
    name: String,
    backing: Backing,
    header: *const RingHeader,
    slots: *const AtomicU64,
    capacity: u32,
    mask: u32,
}

impl Ring {
    /// Round a requested size up to a supported power-of-two capacity
    pub fn capacity_for(count: usize) -> ShmResult<u32> {
        if count == 0 || count > RING_MAX_CAPACITY {
            return Err(ShmError::InvalidConfig(format!(
                "ring size {count} out of range (1..={RING_MAX_CAPACITY})"
            )));
        }
        Ok(count.max(2).next_power_of_two() as u32)
    }

    fn layout_size(capacity: u32) -> usize {
        std::mem::size_of::<RingHeader>() + capacity as usize * std::mem::size_of::<u64>()
    }

    /// Create a ring holding at least `count` descriptors.
    ///
    /// `Shared` rings are published under `name` in `ns` and fail with
    /// [`ShmError::AlreadyExists`] if this process already created one.
    pub fn create(
        ns: &ShmNamespace,
        name: &str,
        count: usize,
        placement: RingPlacement,
    ) -> ShmResult<Self> {
        match placement {
            RingPlacement::Local => Self::create_local(name, count),
            RingPlacement::Shared => Self::create_shared(ns, name, count),
        }
    }

    /// Create a process-local ring
    pub fn create_local(name: &str, count: usize) -> ShmResult<Self> {
        let capacity = Self::capacity_for(count)?;
        let lines = Self::layout_size(capacity).div_ceil(CACHE_LINE);
        let mut storage = vec![CacheLine([0; CACHE_LINE]); lines].into_boxed_slice();
        let base = storage.as_mut_ptr() as *mut u8;

        // SAFETY: storage is zeroed, 64-byte aligned and large enough for the
        // header plus `capacity` slots.
        let ring = unsafe { Self::init(base, name, Backing::Local(storage), capacity) };
        tracing::debug!("Created local ring {} (capacity {})", name, capacity);
        Ok(ring)
    }

    /// Create a ring in a named shared-memory object
    pub fn create_shared(ns: &ShmNamespace, name: &str, count: usize) -> ShmResult<Self> {
        let capacity = Self::capacity_for(count)?;
        let segment = ShmSegment::reserve(ns, name, Self::layout_size(capacity))?;
        let base = segment.as_ptr();

        // SAFETY: a freshly reserved segment is zero-filled, page aligned and
        // sized by layout_size.
        let ring = unsafe { Self::init(base, name, Backing::Shared(segment), capacity) };
        tracing::debug!("Created shared ring {} (capacity {})", name, capacity);
        Ok(ring)
    }

    /// # Safety
    /// `base` must point to zeroed, 64-byte aligned memory of at least
    /// `layout_size(capacity)` bytes owned by `backing`.
    unsafe fn init(base: *mut u8, name: &str, backing: Backing, capacity: u32) -> Self {
        let header = base as *mut RingHeader;
        // SAFETY: header lies at the start of the region, nothing else
        // references it yet.
        unsafe {
            (*header).capacity = capacity;
            (*header).mask = capacity - 1;
            (*header).magic.store(RING_MAGIC, Ordering::Release);
        }
        Self {
            name: name.to_string(),
            backing,
            header,
            // SAFETY: slots start right after the header, within the region
            slots: unsafe { base.add(std::mem::size_of::<RingHeader>()) } as *const AtomicU64,
            capacity,
            mask: capacity - 1,
        }
    }

    /// Map a shared ring created by process `pid`
    pub fn lookup_or_import(ns: &ShmNamespace, name: &str, pid: u32) -> ShmResult<Self> {
        check_name(name)?;
        let segment = ShmSegment::import(ns, name, pid)?;
        let bad = |reason: String| ShmError::BadLayout {
            name: name.to_string(),
            reason,
        };

        if segment.len() < std::mem::size_of::<RingHeader>() {
            return Err(bad(format!("segment too small ({} bytes)", segment.len())));
        }

        let base = segment.as_ptr();
        let header = base as *const RingHeader;
        // SAFETY: the segment holds at least a full header
        let (magic, capacity, mask) = unsafe {
            (
                (*header).magic.load(Ordering::Acquire),
                (*header).capacity,
                (*header).mask,
            )
        };

        if magic != RING_MAGIC {
            return Err(bad(format!("magic {magic:#x}")));
        }
        if !capacity.is_power_of_two() || mask != capacity - 1 {
            return Err(bad(format!("capacity {capacity} mask {mask:#x}")));
        }
        if segment.len() < Self::layout_size(capacity) {
            return Err(bad(format!(
                "segment of {} bytes cannot hold {} slots",
                segment.len(),
                capacity
            )));
        }

        tracing::debug!("Attached ring {} of pid {} (capacity {})", name, pid, capacity);

        Ok(Self {
            name: name.to_string(),
            // SAFETY: header size checked above
            slots: unsafe { base.add(std::mem::size_of::<RingHeader>()) } as *const AtomicU64,
            header,
            backing: Backing::Shared(segment),
            capacity,
            mask,
        })
    }

    /// Unlink a shared ring created by this process.
    ///
    /// Mapped handles stay usable until dropped. Returns `false` when there
    /// was nothing to remove.
    pub fn destroy(ns: &ShmNamespace, name: &str) -> ShmResult<bool> {
        ShmSegment::unlink(ns, name)
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: header points into storage owned by self.backing
        unsafe { &*self.header }
    }

    fn slot(&self, index: u32) -> &AtomicU64 {
        // SAFETY: masked index is below capacity, slots array lives in backing
        unsafe { &*self.slots.add((index & self.mask) as usize) }
    }

    /// Append up to `items.len()` descriptors; returns how many were stored
    pub fn enqueue_burst(&self, items: &[u64]) -> usize {
        let wanted = items.len().min(self.capacity as usize) as u32;
        if wanted == 0 {
            return 0;
        }

        let hdr = self.header();
        let mut head = hdr.prod.head.load(Ordering::Relaxed);
        let n = loop {
            let cons_tail = hdr.cons.tail.load(Ordering::Acquire);
            let free = self
                .capacity
                .wrapping_add(cons_tail)
                .wrapping_sub(head);
            let n = wanted.min(free);
            if n == 0 {
                return 0;
            }
            match hdr.prod.head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break n,
                Err(current) => head = current,
            }
        };

        for (i, item) in items.iter().take(n as usize).enumerate() {
            self.slot(head.wrapping_add(i as u32))
                .store(*item, Ordering::Relaxed);
        }

        while hdr.prod.tail.load(Ordering::Acquire) != head {
            hint::spin_loop();
        }
        hdr.prod.tail.store(head.wrapping_add(n), Ordering::Release);

        n as usize
    }

    /// Remove up to `out.len()` descriptors in FIFO order; returns how many
    /// were written to the front of `out`
    pub fn dequeue_burst(&self, out: &mut [u64]) -> usize {
        let wanted = out.len().min(self.capacity as usize) as u32;
        if wanted == 0 {
            return 0;
        }

        let hdr = self.header();
        let mut head = hdr.cons.head.load(Ordering::Relaxed);
        let n = loop {
            let prod_tail = hdr.prod.tail.load(Ordering::Acquire);
            let avail = prod_tail.wrapping_sub(head);
            let n = wanted.min(avail);
            if n == 0 {
                return 0;
            }
            match hdr.cons.head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break n,
                Err(current) => head = current,
            }
        };

        for (i, slot) in out.iter_mut().take(n as usize).enumerate() {
            *slot = self
                .slot(head.wrapping_add(i as u32))
                .load(Ordering::Relaxed);
        }

        while hdr.cons.tail.load(Ordering::Acquire) != head {
            hint::spin_loop();
        }
        hdr.cons.tail.store(head.wrapping_add(n), Ordering::Release);

        n as usize
    }

    /// Number of descriptors currently queued
    pub fn count(&self) -> usize {
        let hdr = self.header();
        let cons = hdr.cons.tail.load(Ordering::Acquire);
        let prod = hdr.prod.tail.load(Ordering::Acquire);
        (prod.wrapping_sub(cons)).min(self.capacity) as usize
    }

    /// Number of descriptors that can still be enqueued
    pub fn free_count(&self) -> usize {
        self.capacity as usize - self.count()
    }

    /// Maximum number of descriptors the ring holds
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// True when no descriptor is queued
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Ring name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the ring storage lives
    pub fn placement(&self) -> RingPlacement {
        match self.backing {
            Backing::Local(_) => RingPlacement::Local,
            Backing::Shared(_) => RingPlacement::Shared,
        }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("placement", &self.placement())
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish()
    }
}

// SAFETY: all cross-thread access to ring memory goes through atomics; the
// raw pointers refer to storage owned by `backing`, which moves with the Ring.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}
