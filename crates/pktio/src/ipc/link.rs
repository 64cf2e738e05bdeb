//! One end of a shared-memory link.
//!
//! Four rings connect the two processes. Seen from the master:
//!
//! | ring      | master   | slave    |
//! |-----------|----------|----------|
//! | `_m_prod` | tx send  | rx recv  |
//! | `_m_cons` | tx free  | rx free  |
//! | `_s_prod` | rx recv  | tx send  |
//! | `_s_cons` | rx free  | tx free  |
//!
//! A sender enqueues offsets of packets in its own pool. The receiver copies
//! each packet into its local pool and hands the offset back on its rx free
//! ring; the sender reclaims those blocks at its next send or receive.
//! Descriptors that cannot be copied yet (local pool exhausted) wait in a
//! process-local cache and are served before the shared ring.

use crate::config::IpcConfig;
use crate::entry::EntryCore;
use crate::error::{PktioError, PktioResult};
use crate::ipc::info::InfoBlock;
use crate::ops::{BackendKind, LinkStatus, MacAddr, PktioOps, StatsSnapshot};
use pktio_shm::segment::current_pid;
use pktio_shm::{Packet, Pool, PoolOffset, RemotePool, Ring, ShmNamespace};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Master transmit ring suffix
pub const M_PROD: &str = "_m_prod";
/// Master free ring suffix
pub const M_CONS: &str = "_m_cons";
/// Slave transmit ring suffix
pub const S_PROD: &str = "_s_prod";
/// Slave free ring suffix
pub const S_CONS: &str = "_s_cons";

/// MTU of an IPC link
pub const IPC_MTU: u32 = 9 * 1024;

/// MAC address reported by IPC links
pub const IPC_MAC: MacAddr = MacAddr([0x12; 6]);

const DRAIN_BURST: usize = 64;

/// Which end of the link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcRole {
    /// Creates the link objects
    Master,
    /// Attaches to the objects of the master process
    Slave {
        /// Master process id
        master_pid: u32,
    },
}

struct LinkRings {
    tx_send: Ring,
    tx_free: Ring,
    rx_recv: Ring,
    rx_free: Ring,
}

fn ring_name(dev: &str, suffix: &str) -> String {
    format!("{dev}{suffix}")
}

impl LinkRings {
    fn create(ns: &ShmNamespace, dev: &str, entries: usize) -> PktioResult<Self> {
        let create = |suffix: &str| Ring::create_shared(ns, &ring_name(dev, suffix), entries);
        let rings = (|| -> PktioResult<Self> {
            Ok(Self {
                tx_send: create(M_PROD)?,
                tx_free: create(M_CONS)?,
                rx_recv: create(S_PROD)?,
                rx_free: create(S_CONS)?,
            })
        })();
        if rings.is_err() {
            Self::destroy(ns, dev);
        }
        rings
    }

    fn attach(ns: &ShmNamespace, dev: &str, master_pid: u32) -> PktioResult<Self> {
        let attach = |suffix: &str| Ring::lookup_or_import(ns, &ring_name(dev, suffix), master_pid);
        Ok(Self {
            rx_recv: attach(M_PROD)?,
            rx_free: attach(M_CONS)?,
            tx_send: attach(S_PROD)?,
            tx_free: attach(S_CONS)?,
        })
    }

    fn destroy(ns: &ShmNamespace, dev: &str) {
        for suffix in [M_PROD, M_CONS, S_PROD, S_CONS] {
            let name = ring_name(dev, suffix);
            if let Err(e) = Ring::destroy(ns, &name) {
                tracing::warn!("Failed to destroy ring {}: {}", name, e);
            }
        }
    }
}

/// Dequeue everything from `ring`, handing each descriptor to `each`
fn drain_ring(ring: &Ring, mut each: impl FnMut(u64)) -> usize {
    let mut buf = [0u64; DRAIN_BURST];
    let mut total = 0;
    loop {
        let n = ring.dequeue_burst(&mut buf);
        if n == 0 {
            return total;
        }
        buf[..n].iter().copied().for_each(&mut each);
        total += n;
    }
}

/// Enqueue `descs` on `ring`, retrying while the ring is full.
///
/// Without a deadline this spins until the peer drains the ring. Returns the
/// descriptors that could not be enqueued before `deadline`.
pub(crate) fn return_descriptors<'a>(
    ring: &Ring,
    descs: &'a [u64],
    deadline: Option<Instant>,
) -> &'a [u64] {
    let mut pending = descs;
    loop {
        let n = ring.enqueue_burst(pending);
        pending = &pending[n..];
        if pending.is_empty() {
            return pending;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return pending;
        }
        std::hint::spin_loop();
    }
}

/// Open IPC interface
pub struct IpcLink {
    role: IpcRole,
    dev: String,
    ns: ShmNamespace,
    pool: Pool,
    info: InfoBlock,
    config: IpcConfig,
    ready: AtomicBool,
    stop_unsent: AtomicUsize,
    rings: spin::RwLock<Option<Arc<LinkRings>>>,
    remote: spin::RwLock<Option<Arc<RemotePool>>>,
    rx_cache: Ring,
    backlog: spin::Mutex<Vec<u64>>,
}

impl IpcLink {
    /// Create the link objects of `dev` and publish `pool`
    pub(crate) fn open_master(core: &EntryCore, dev: &str, pool: &Pool) -> PktioResult<Self> {
        let ns = core.namespace().clone();
        let config = core.subsystem().ipc.clone();

        let rx_cache = Ring::create_local("ipc_rx_cache", config.ring_entries)?;
        let rings = LinkRings::create(&ns, dev, config.ring_entries)?;
        let info = match InfoBlock::create(&ns, dev) {
            Ok(info) => info,
            Err(e) => {
                LinkRings::destroy(&ns, dev);
                return Err(e);
            }
        };
        info.slave().clear();
        if let Err(e) = info.master().publish(&pool.describe(), current_pid()) {
            LinkRings::destroy(&ns, dev);
            let _ = InfoBlock::unlink(&ns, dev);
            return Err(e);
        }

        let link = Self {
            role: IpcRole::Master,
            dev: dev.to_string(),
            ns,
            pool: pool.clone(),
            info,
            config,
            ready: AtomicBool::new(false),
            stop_unsent: AtomicUsize::new(0),
            rings: spin::RwLock::new(Some(Arc::new(rings))),
            remote: spin::RwLock::new(None),
            rx_cache,
            backlog: spin::Mutex::new(Vec::new()),
        };
        tracing::info!("{}: master created link, pool {}", dev, pool.name());

        if let Err(e) = link.master_start() {
            tracing::debug!("{}: slave not attached yet: {}", dev, e);
        }
        Ok(link)
    }

    /// Attach to the link `dev` of process `master_pid`
    pub(crate) fn open_slave(
        core: &EntryCore,
        dev: &str,
        master_pid: u32,
        pool: &Pool,
    ) -> PktioResult<Self> {
        let ns = core.namespace().clone();
        let config = core.subsystem().ipc.clone();

        let info = InfoBlock::import(&ns, dev, master_pid)?;
        if !info.master().is_ready() {
            return Err(PktioError::PeerNotReady(format!(
                "{dev}: master pid {master_pid} has not published its pool"
            )));
        }

        let rx_cache = Ring::create_local("ipc_rx_cache", config.ring_entries)?;
        tracing::info!("{}: slave attached to master pid {}", dev, master_pid);
        Ok(Self {
            role: IpcRole::Slave { master_pid },
            dev: dev.to_string(),
            ns,
            pool: pool.clone(),
            info,
            config,
            ready: AtomicBool::new(false),
            stop_unsent: AtomicUsize::new(0),
            rings: spin::RwLock::new(None),
            remote: spin::RwLock::new(None),
            rx_cache,
            backlog: spin::Mutex::new(Vec::new()),
        })
    }

    /// End of the link this interface is
    pub fn role(&self) -> IpcRole {
        self.role
    }

    /// Both ends have finished the handshake
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn rings(&self) -> Option<Arc<LinkRings>> {
        self.rings.read().clone()
    }

    fn remote(&self) -> Option<Arc<RemotePool>> {
        self.remote.read().clone()
    }

    fn master_start(&self) -> PktioResult<()> {
        let slave = self.info.slave();
        if !slave.is_ready() {
            return Err(PktioError::PeerNotReady(format!(
                "{}: slave has not started",
                self.dev
            )));
        }
        let peer = slave.snapshot();
        let remote = RemotePool::import(&self.ns, &peer.pool_name, peer.pid)?;
        *self.remote.write() = Some(Arc::new(remote));
        self.ready.store(true, Ordering::Release);
        tracing::info!(
            "{}: master ready, slave pid {} pool {}",
            self.dev,
            peer.pid,
            peer.pool_name
        );
        Ok(())
    }

    fn slave_start(&self, master_pid: u32) -> PktioResult<()> {
        let rings = LinkRings::attach(&self.ns, &self.dev, master_pid)?;
        let master = self.info.master().snapshot();
        let remote = RemotePool::import(&self.ns, &master.pool_name, master_pid)?;
        *self.rings.write() = Some(Arc::new(rings));
        *self.remote.write() = Some(Arc::new(remote));

        self.info.slave().publish(&self.pool.describe(), current_pid())?;
        self.ready.store(true, Ordering::Release);
        tracing::info!(
            "{}: slave ready, master pid {} pool {}",
            self.dev,
            master_pid,
            master.pool_name
        );
        Ok(())
    }

    /// Free local blocks listed on `ring`
    fn reclaim_from(&self, ring: &Ring) -> usize {
        drain_ring(ring, |desc| {
            if let Err(e) = self.pool.reclaim(PoolOffset::new(desc)) {
                tracing::warn!("{}: bad descriptor {:#x} on {}: {}", self.dev, desc, ring.name(), e);
            }
        })
    }

    fn flush_backlog(&self, rx_free: &Ring) {
        let mut backlog = self.backlog.lock();
        if backlog.is_empty() {
            return;
        }
        let n = rx_free.enqueue_burst(&backlog);
        backlog.drain(..n);
    }

    fn return_to_peer(&self, rx_free: &Ring, descs: &[u64]) {
        let deadline = self
            .config
            .free_ring_deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let left = return_descriptors(rx_free, descs, deadline);
        if !left.is_empty() {
            tracing::warn!(
                "{}: peer free ring full, holding {} descriptors for the next receive",
                self.dev,
                left.len()
            );
            self.backlog.lock().extend_from_slice(left);
        }
    }

    /// Put unprocessed descriptors back at the head of the cache
    fn park(&self, rest: &[u64]) {
        let mut behind = vec![0u64; self.rx_cache.count()];
        let n = self.rx_cache.dequeue_burst(&mut behind);
        behind.truncate(n);

        let parked = self.rx_cache.enqueue_burst(rest);
        let requeued = self.rx_cache.enqueue_burst(&behind);
        if parked != rest.len() || requeued != behind.len() {
            panic!(
                "{}: rx cache overflow parking {} descriptors ({} queued)",
                self.dev,
                rest.len(),
                behind.len()
            );
        }
    }

    /// Free what the peer acknowledged, then report what is left in flight
    fn drain_acked(&self, rings: &LinkRings, unsent: usize) {
        let acked = self.reclaim_from(&rings.tx_free);
        tracing::debug!(
            "{}: freed {} unsent and {} acknowledged packets, {} queued to us, {} in our free ring",
            self.dev,
            unsent,
            acked,
            rings.rx_recv.count(),
            rings.rx_free.count()
        );
    }
}

impl PktioOps for IpcLink {
    fn kind(&self) -> BackendKind {
        match self.role {
            IpcRole::Master => BackendKind::IpcMaster,
            IpcRole::Slave { .. } => BackendKind::IpcSlave,
        }
    }

    fn recv(
        &self,
        core: &EntryCore,
        queue: usize,
        out: &mut Vec<Packet>,
        max: usize,
    ) -> PktioResult<usize> {
        let _guard = core.rx_lock(queue);
        if !self.is_ready() {
            return Ok(0);
        }
        let (Some(rings), Some(remote)) = (self.rings(), self.remote()) else {
            return Ok(0);
        };

        self.reclaim_from(&rings.tx_free);
        self.flush_backlog(&rings.rx_free);

        let mut descs = vec![0u64; max.min(self.rx_cache.capacity())];
        let mut n = self.rx_cache.dequeue_burst(&mut descs);
        if n == 0 {
            n = rings.rx_recv.dequeue_burst(&mut descs);
        }
        if n == 0 {
            return Ok(0);
        }
        descs.truncate(n);

        let mut consumed = Vec::with_capacity(n);
        let mut received = 0u64;
        let mut octets = 0u64;
        let mut errors = 0u64;
        let mut next = 0;
        while next < n {
            let desc = descs[next];
            let hdr = match remote.header(PoolOffset::new(desc)) {
                Ok(hdr) => hdr,
                Err(e) => {
                    tracing::warn!("{}: dropping bad descriptor {:#x}: {}", self.dev, desc, e);
                    errors += 1;
                    next += 1;
                    continue;
                }
            };

            let len = hdr.frame_len();
            let payload = match remote.payload(hdr) {
                Ok(payload) if len <= self.pool.buf_len() => payload,
                Ok(_) => {
                    tracing::warn!(
                        "{}: {} byte frame does not fit pool {}",
                        self.dev,
                        len,
                        self.pool.name()
                    );
                    errors += 1;
                    consumed.push(desc);
                    next += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("{}: bad payload in {:#x}: {}", self.dev, desc, e);
                    errors += 1;
                    consumed.push(desc);
                    next += 1;
                    continue;
                }
            };

            let Some(mut pkt) = self
                .pool
                .alloc_with_headroom(len, hdr.headroom())
                .or_else(|| self.pool.alloc(len))
                .or_else(|| self.pool.alloc_with_headroom(len, 0))
            else {
                break;
            };
            pkt.data_mut().copy_from_slice(payload);
            pkt.copy_metadata_from(hdr);
            out.push(pkt);

            received += 1;
            octets += len as u64;
            consumed.push(desc);
            next += 1;
        }

        if next < n {
            tracing::trace!("{}: pool empty, caching {} descriptors", self.dev, n - next);
            self.park(&descs[next..]);
        }
        self.return_to_peer(&rings.rx_free, &consumed);

        core.stats().record_rx(received, octets);
        if errors > 0 {
            core.stats().record_in_errors(errors);
        }
        Ok(received as usize)
    }

    fn send(&self, core: &EntryCore, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize> {
        let _guard = core.tx_lock(queue);
        if !self.is_ready() {
            return Ok(0);
        }
        let Some(rings) = self.rings() else {
            return Ok(0);
        };
        self.reclaim_from(&rings.tx_free);

        let len = pkts.len();
        let mut batch = pkts.drain(..).collect::<Vec<_>>().into_iter();
        // (packet in our pool, caller's original when it was copied)
        let mut mapped: Vec<(Packet, Option<Packet>)> = Vec::with_capacity(len);
        let mut not_mapped = Vec::new();
        for pkt in batch.by_ref() {
            if pkt.pool().ptr_eq(&self.pool) && !pkt.has_ref() {
                mapped.push((pkt, None));
                continue;
            }
            match pkt.copy_to(&self.pool) {
                Some(copy) => mapped.push((copy, Some(pkt))),
                None => {
                    tracing::warn!(
                        "{}: no room in pool {} to copy packet, sending {} of {}",
                        self.dev,
                        self.pool.name(),
                        mapped.len(),
                        len
                    );
                    not_mapped.push(pkt);
                    break;
                }
            }
        }
        not_mapped.extend(batch);

        let offsets: Vec<u64> = mapped.iter().map(|(pkt, _)| pkt.offset().get()).collect();
        let sent = rings.tx_send.enqueue_burst(&offsets);

        let mut octets = 0u64;
        let mut unsent = Vec::with_capacity(len - sent);
        for (i, (pkt, original)) in mapped.into_iter().enumerate() {
            if i < sent {
                octets += pkt.len() as u64;
                // the ring owns the block until the peer hands it back
                let _ = pkt.into_offset();
            } else {
                unsent.push(original.unwrap_or(pkt));
            }
        }
        unsent.extend(not_mapped);
        *pkts = unsent;

        if sent > 0 {
            core.stats().record_tx(sent as u64, octets);
        }
        Ok(sent)
    }

    fn start(&self, core: &EntryCore) -> PktioResult<()> {
        if self.is_ready() {
            return Err(PktioError::InvalidState {
                name: self.dev.clone(),
                op: "start",
                state: core.state(),
            });
        }
        match self.role {
            IpcRole::Master => self.master_start(),
            IpcRole::Slave { master_pid } => self.slave_start(master_pid),
        }
    }

    fn stop(&self, _core: &EntryCore) -> PktioResult<()> {
        self.ready.store(false, Ordering::Release);
        let unsent = self.rings().map_or(0, |rings| self.reclaim_from(&rings.tx_send));
        self.stop_unsent.store(unsent, Ordering::Relaxed);
        Ok(())
    }

    fn drain_stopped(&self, _core: &EntryCore) -> PktioResult<()> {
        let grace = Duration::from_millis(self.config.stop_grace_ms);
        if !grace.is_zero() {
            std::thread::sleep(grace);
        }
        if let Some(rings) = self.rings() {
            self.drain_acked(&rings, self.stop_unsent.swap(0, Ordering::Relaxed));
        }
        Ok(())
    }

    fn close(&self, _core: &EntryCore) -> PktioResult<()> {
        self.ready.store(false, Ordering::Release);
        let rings = self.rings.write().take();
        if let Some(rings) = rings {
            let unsent = self.reclaim_from(&rings.tx_send);
            self.drain_acked(&rings, unsent);

            let mut held = std::mem::take(&mut *self.backlog.lock());
            drain_ring(&self.rx_cache, |desc| held.push(desc));
            let returned = rings.rx_free.enqueue_burst(&held);
            if returned < held.len() {
                tracing::warn!(
                    "{}: could not return {} descriptors to the peer",
                    self.dev,
                    held.len() - returned
                );
            }
        }
        self.remote.write().take();

        if self.role == IpcRole::Master {
            LinkRings::destroy(&self.ns, &self.dev);
            InfoBlock::unlink(&self.ns, &self.dev)?;
        }
        tracing::info!("{}: link closed", self.dev);
        Ok(())
    }

    fn stats(&self, core: &EntryCore) -> PktioResult<StatsSnapshot> {
        Ok(core.stats().snapshot())
    }

    fn stats_reset(&self, core: &EntryCore) -> PktioResult<()> {
        core.stats().reset();
        Ok(())
    }

    fn mtu(&self, _core: &EntryCore) -> PktioResult<u32> {
        Ok(IPC_MTU)
    }

    fn mac_addr(&self, _core: &EntryCore) -> PktioResult<MacAddr> {
        Ok(IPC_MAC)
    }

    fn link_status(&self, _core: &EntryCore) -> PktioResult<LinkStatus> {
        Ok(if self.is_ready() {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PktioSubsystemConfig;
    use crate::entry::{PktioEntry, PktioState};
    use crate::ops::PktioParam;
    use crate::registry::PktioRegistry;
    use pktio_shm::PoolParams;

    struct Link {
        registry: Arc<PktioRegistry>,
        master_pool: Pool,
        slave_pool: Pool,
        master: Arc<PktioEntry>,
        slave: Arc<PktioEntry>,
        _dir: tempfile::TempDir,
    }

    fn registry(dir: &tempfile::TempDir, ring_entries: usize) -> Arc<PktioRegistry> {
        registry_with_grace(dir, ring_entries, 0)
    }

    fn registry_with_grace(
        dir: &tempfile::TempDir,
        ring_entries: usize,
        stop_grace_ms: u64,
    ) -> Arc<PktioRegistry> {
        let mut config = PktioSubsystemConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.ipc.ring_entries = ring_entries;
        config.ipc.stop_grace_ms = stop_grace_ms;
        PktioRegistry::new(config).unwrap()
    }

    fn slave_name(dev: &str) -> String {
        format!("ipc:{}:{}", current_pid(), dev.trim_start_matches("ipc:"))
    }

    fn link(ring_entries: usize, slave_blocks: u32) -> Link {
        link_with_grace(ring_entries, slave_blocks, 0)
    }

    fn link_with_grace(ring_entries: usize, slave_blocks: u32, stop_grace_ms: u64) -> Link {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_grace(&dir, ring_entries, stop_grace_ms);
        let ns = registry.namespace().clone();
        let master_pool = Pool::create(&ns, &PoolParams::new("mpool", 64, 256)).unwrap();
        let slave_pool = Pool::create(&ns, &PoolParams::new("spool", slave_blocks, 256)).unwrap();

        let master = registry
            .open("ipc:t0", &master_pool, PktioParam::default())
            .unwrap();
        let slave = registry
            .open(&slave_name("ipc:t0"), &slave_pool, PktioParam::default())
            .unwrap();
        slave.start().unwrap();
        master.start().unwrap();
        Link {
            registry,
            master_pool,
            slave_pool,
            master,
            slave,
            _dir: dir,
        }
    }

    fn frames(pool: &Pool, n: usize, len: usize) -> Vec<Packet> {
        (0..n)
            .map(|i| pool.alloc_copy(&vec![i as u8; len]).unwrap())
            .collect()
    }

    #[test]
    fn test_master_to_slave_and_reclaim() {
        let l = link(64, 32);
        assert_eq!(l.master.kind(), BackendKind::IpcMaster);
        assert_eq!(l.slave.kind(), BackendKind::IpcSlave);

        let mut pkts = frames(&l.master_pool, 10, 100);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 10);
        assert!(pkts.is_empty());
        assert_eq!(l.master_pool.available(), 54);

        let mut out = Vec::new();
        assert_eq!(l.slave.recv(0, &mut out, 32).unwrap(), 10);
        for (i, pkt) in out.iter().enumerate() {
            assert!(pkt.pool().ptr_eq(&l.slave_pool));
            assert_eq!(pkt.data(), &[i as u8; 100][..]);
        }

        let mut none = Vec::new();
        assert_eq!(l.master.recv(0, &mut none, 8).unwrap(), 0);
        assert_eq!(l.master_pool.available(), 64);

        let stats = l.slave.stats().unwrap();
        assert_eq!(stats.in_packets, 10);
        assert_eq!(stats.in_octets, 1000);
        assert_eq!(l.master.stats().unwrap().out_packets, 10);
    }

    #[test]
    fn test_slave_to_master() {
        let l = link(64, 32);
        let mut pkts = frames(&l.slave_pool, 3, 64);
        assert_eq!(l.slave.send(0, &mut pkts).unwrap(), 3);

        let mut out = Vec::new();
        assert_eq!(l.master.recv(0, &mut out, 8).unwrap(), 3);
        assert!(out.iter().all(|p| p.pool().ptr_eq(&l.master_pool)));

        let mut none = Vec::new();
        l.slave.recv(0, &mut none, 8).unwrap();
        assert_eq!(l.slave_pool.available(), 32);
    }

    #[test]
    fn test_exhausted_pool_caches_in_order() {
        let l = link(64, 5);
        let held = frames(&l.slave_pool, 3, 10);

        let mut pkts = frames(&l.master_pool, 5, 40);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 5);

        let mut out = Vec::new();
        assert_eq!(l.slave.recv(0, &mut out, 16).unwrap(), 2);
        assert_eq!(out[0].data()[0], 0);
        assert_eq!(out[1].data()[0], 1);

        drop(held);
        drop(out);
        let mut out = Vec::new();
        assert_eq!(l.slave.recv(0, &mut out, 16).unwrap(), 3);
        let firsts: Vec<u8> = out.iter().map(|p| p.data()[0]).collect();
        assert_eq!(firsts, vec![2, 3, 4]);
    }

    #[test]
    fn test_cache_keeps_order_with_small_bursts() {
        let l = link(64, 1);
        let mut pkts = frames(&l.master_pool, 6, 20);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 6);

        // the first burst parks three descriptors, later bursts take two of
        // them at a time and park one back ahead of the rest
        let mut seen = Vec::new();
        for max in [4, 2, 2, 2, 2, 2] {
            let mut out = Vec::new();
            assert_eq!(l.slave.recv(0, &mut out, max).unwrap(), 1);
            seen.extend(out.iter().map(|p| p.data()[0]));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_full_ring_keeps_unsent() {
        let l = link(8, 32);
        let mut pkts = frames(&l.master_pool, 12, 16);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 8);
        assert_eq!(pkts.len(), 4);
        assert_eq!(pkts[0].data()[0], 8);
    }

    #[test]
    fn test_foreign_and_shared_packets_are_copied() {
        let l = link(64, 32);
        let other = Pool::create(l.registry.namespace(), &PoolParams::new("opool", 4, 128)).unwrap();
        let foreign = other.alloc_copy(b"foreign").unwrap();
        let local = l.master_pool.alloc_copy(b"shared").unwrap();
        let shared = local.reference();

        let mut pkts = vec![foreign, shared];
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 2);
        assert_eq!(other.available(), 4);
        assert_eq!(local.data(), b"shared");

        let mut out = Vec::new();
        l.slave.recv(0, &mut out, 8).unwrap();
        assert_eq!(out[0].data(), b"foreign");
        assert_eq!(out[1].data(), b"shared");
    }

    #[test]
    fn test_master_start_needs_slave() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 64);
        let pool = Pool::create(registry.namespace(), &PoolParams::new("mpool", 8, 256)).unwrap();
        let master = registry.open("ipc:t1", &pool, PktioParam::default()).unwrap();
        assert!(matches!(master.start(), Err(PktioError::PeerNotReady(_))));
        assert_eq!(master.state(), PktioState::Opened);
        assert_eq!(master.link_status().unwrap(), LinkStatus::Down);
    }

    #[test]
    fn test_slave_needs_master() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 64);
        let pool = Pool::create(registry.namespace(), &PoolParams::new("spool", 8, 256)).unwrap();
        assert!(registry
            .open(&slave_name("ipc:absent"), &pool, PktioParam::default())
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_start_cycle() {
        let l = link(64, 32);
        l.master.stop().unwrap();
        let mut pkts = frames(&l.master_pool, 1, 10);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 0);

        l.master.start().unwrap();
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 1);
        let mut out = Vec::new();
        assert_eq!(l.slave.recv(0, &mut out, 8).unwrap(), 1);
    }

    #[test]
    fn test_start_on_ready_link_is_rejected() {
        let l = link(64, 32);
        assert!(matches!(
            l.master.ops().start(l.master.core()),
            Err(PktioError::InvalidState { op: "start", .. })
        ));
        assert!(matches!(
            l.slave.ops().start(l.slave.core()),
            Err(PktioError::InvalidState { op: "start", .. })
        ));
        assert_eq!(l.master.core().state(), PktioState::Started);
    }

    #[test]
    fn test_control_calls_during_stop_grace() {
        let l = link_with_grace(64, 32, 1000);
        let mut pkts = frames(&l.master_pool, 4, 10);
        assert_eq!(l.master.send(0, &mut pkts).unwrap(), 4);
        let mut out = Vec::new();
        assert_eq!(l.slave.recv(0, &mut out, 8).unwrap(), 4);

        let stopper = {
            let master = Arc::clone(&l.master);
            std::thread::spawn(move || master.stop())
        };
        while l.master.state() != PktioState::Stopped {
            std::thread::yield_now();
        }

        // the grace period runs without the control lock
        let begin = Instant::now();
        l.master.promisc_mode_set(true).unwrap();
        assert_eq!(l.master.link_status().unwrap(), LinkStatus::Down);
        assert!(begin.elapsed() < Duration::from_millis(500));

        stopper.join().unwrap().unwrap();
        assert_eq!(l.master_pool.available(), 64);
    }

    #[test]
    fn test_stop_frees_unconsumed() {
        let l = link(64, 32);
        let mut pkts = frames(&l.master_pool, 4, 10);
        l.master.send(0, &mut pkts).unwrap();
        assert_eq!(l.master_pool.available(), 60);
        l.master.stop().unwrap();
        assert_eq!(l.master_pool.available(), 64);
    }

    #[test]
    fn test_close_removes_objects() {
        let l = link(64, 32);
        let ns = l.registry.namespace().clone();
        let pid = current_pid();
        let names: Vec<String> = [M_PROD, M_CONS, S_PROD, S_CONS]
            .iter()
            .map(|s| ring_name("ipc:t0", s))
            .chain(std::iter::once(InfoBlock::object_name("ipc:t0")))
            .collect();
        assert!(names.iter().all(|n| ns.object_path(n, pid).exists()));

        l.slave.stop().unwrap();
        l.registry.close(&l.slave).unwrap();
        assert!(names.iter().all(|n| ns.object_path(n, pid).exists()));

        l.master.stop().unwrap();
        l.registry.close(&l.master).unwrap();
        assert!(names.iter().all(|n| !ns.object_path(n, pid).exists()));
    }

    #[test]
    fn test_properties() {
        let l = link(64, 32);
        assert_eq!(l.master.mtu().unwrap(), IPC_MTU);
        assert_eq!(l.slave.mac_addr().unwrap(), Some(IPC_MAC));
        assert_eq!(l.master.link_status().unwrap(), LinkStatus::Up);
        assert_eq!(l.master.promisc_mode().unwrap(), None);
    }

    #[test]
    fn test_return_descriptors_deadline() {
        let ring = Ring::create_local("free", 2).unwrap();
        let left = return_descriptors(&ring, &[1, 2, 3], Some(Instant::now()));
        assert_eq!(left, &[3]);

        let mut buf = [0u64; 2];
        assert_eq!(ring.dequeue_burst(&mut buf), 2);
        assert!(return_descriptors(&ring, &[4], None).is_empty());
    }
}
