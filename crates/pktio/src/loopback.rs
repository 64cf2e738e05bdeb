//! Loopback backend.
//!
//! Everything sent on `loop` comes back on its single input queue, in order.
//! Packets are not copied; the loop queue holds the sender's handles.

use crate::classify::classify_received;
use crate::entry::{EntryCore, timestamp_now_ns};
use crate::error::{PktioError, PktioResult};
use crate::ops::{
    BackendKind, Capability, LinkStatus, MacAddr, PktinConfigOpt, PktioConfig, PktioModule,
    PktioOps, SetOps, StatsSnapshot,
};
use crossbeam_queue::ArrayQueue;
use pktio_shm::{Packet, PacketSubtype, Pool};
use std::sync::atomic::{AtomicBool, Ordering};

/// Device name of the loopback interface
pub const LOOP_DEVNAME: &str = "loop";

/// Most packets moved by one receive or send call
pub const QUEUE_MULTI_MAX: usize = 8;

/// MAC address reported by `loop`
pub const LOOP_MAC: MacAddr = MacAddr([0x02, 0xe9, 0x34, 0x80, 0x73, 0x01]);

/// Opens `loop`
#[derive(Debug, Default)]
pub struct LoopbackModule;

impl PktioModule for LoopbackModule {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn matches(&self, devname: &str) -> bool {
        devname == LOOP_DEVNAME
    }

    fn open(
        &self,
        core: &EntryCore,
        devname: &str,
        _pool: &Pool,
    ) -> PktioResult<Box<dyn PktioOps>> {
        if devname != LOOP_DEVNAME {
            return Err(PktioError::InvalidDevice(devname.to_string()));
        }
        core.stats().reset();
        Ok(Box::new(Loopback {
            queue: ArrayQueue::new(core.subsystem().loopback.queue_size),
            promisc: AtomicBool::new(false),
        }))
    }
}

/// State of an open `loop` interface
pub struct Loopback {
    queue: ArrayQueue<Packet>,
    promisc: AtomicBool,
}

impl PktioOps for Loopback {
    fn kind(&self) -> BackendKind {
        BackendKind::Loopback
    }

    fn recv(
        &self,
        core: &EntryCore,
        queue: usize,
        out: &mut Vec<Packet>,
        max: usize,
    ) -> PktioResult<usize> {
        let max = max.min(QUEUE_MULTI_MAX);
        let start = out.len();
        let timestamps = core.config().pktin.timestamps();

        {
            let _guard = core.rx_lock(queue);
            let ts = timestamps.then(timestamp_now_ns);
            while out.len() - start < max {
                let Some(mut pkt) = self.queue.pop() else {
                    break;
                };
                if let Some(ts) = ts {
                    if !pkt.has_ref() {
                        pkt.set_timestamp_ns(ts);
                    }
                }
                out.push(pkt);
            }
        }

        let kept = classify_received(core, out, start);
        let octets: usize = out[start..].iter().map(Packet::len).sum();
        core.stats().record_rx(kept as u64, octets as u64);
        Ok(kept)
    }

    fn send(&self, core: &EntryCore, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize> {
        let len = pkts.len().min(QUEUE_MULTI_MAX);

        if core.config().outbound_ipsec {
            for pkt in pkts.iter_mut().take(len) {
                if pkt.subtype() == PacketSubtype::Ipsec && !pkt.has_ref() {
                    pkt.set_subtype(PacketSubtype::Basic);
                }
            }
        }

        let _guard = core.tx_lock(queue);
        let mut sent = 0;
        let mut octets = 0;
        let mut unsent = Vec::new();
        for pkt in pkts.drain(..len).collect::<Vec<_>>() {
            if !unsent.is_empty() {
                unsent.push(pkt);
                continue;
            }
            let bytes = pkt.len();
            match self.queue.push(pkt) {
                Ok(()) => {
                    sent += 1;
                    octets += bytes;
                }
                Err(pkt) => {
                    tracing::debug!("{}: loop queue full", core.name());
                    unsent.push(pkt);
                }
            }
        }
        if !unsent.is_empty() {
            unsent.append(pkts);
            *pkts = unsent;
        }

        if sent > 0 {
            core.stats().record_tx(sent as u64, octets as u64);
        }
        Ok(sent)
    }

    fn config(&self, _core: &EntryCore, _config: &PktioConfig) -> PktioResult<()> {
        Ok(())
    }

    fn capability(&self, _core: &EntryCore) -> PktioResult<Capability> {
        Ok(Capability {
            max_input_queues: 1,
            max_output_queues: 1,
            config: PktioConfig {
                pktin: PktinConfigOpt {
                    ts_all: true,
                    ts_ptp: true,
                },
                inbound_ipsec: true,
                outbound_ipsec: true,
            },
            set_op: SetOps {
                promisc_mode: true,
                mac_addr: false,
            },
        })
    }

    fn stats(&self, core: &EntryCore) -> PktioResult<StatsSnapshot> {
        Ok(core.stats().snapshot())
    }

    fn stats_reset(&self, core: &EntryCore) -> PktioResult<()> {
        core.stats().reset();
        Ok(())
    }

    fn mtu(&self, _core: &EntryCore) -> PktioResult<u32> {
        Ok(i32::MAX as u32)
    }

    fn promisc_mode_set(&self, _core: &EntryCore, enable: bool) -> PktioResult<()> {
        self.promisc.store(enable, Ordering::Relaxed);
        Ok(())
    }

    fn promisc_mode(&self, _core: &EntryCore) -> PktioResult<bool> {
        Ok(self.promisc.load(Ordering::Relaxed))
    }

    fn mac_addr(&self, _core: &EntryCore) -> PktioResult<MacAddr> {
        Ok(LOOP_MAC)
    }

    fn link_status(&self, _core: &EntryCore) -> PktioResult<LinkStatus> {
        Ok(LinkStatus::Up)
    }

    fn close(&self, core: &EntryCore) -> PktioResult<()> {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!("{}: dropped {} queued packets at close", core.name(), dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, ClassifyError, Classifier, ParserClassifier};
    use crate::config::PktioSubsystemConfig;
    use crate::entry::{PktioEntry, PktioState};
    use crate::ops::PktioParam;
    use crate::registry::PktioRegistry;
    use pktio_shm::PoolParams;
    use std::sync::Arc;

    fn open_loop(queue_size: usize) -> (tempfile::TempDir, Arc<PktioRegistry>, Pool, Arc<PktioEntry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PktioSubsystemConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.loopback.queue_size = queue_size;
        let registry = PktioRegistry::new(config).unwrap();
        let pool = Pool::create(registry.namespace(), &PoolParams::new("lbk", 32, 512)).unwrap();
        let entry = registry.open("loop", &pool, PktioParam::default()).unwrap();
        (dir, registry, pool, entry)
    }

    fn frames(pool: &Pool, n: usize) -> Vec<Packet> {
        (0..n)
            .map(|i| pool.alloc_copy(&[i as u8; 60]).unwrap())
            .collect()
    }

    #[test]
    fn test_only_exact_name() {
        let module = LoopbackModule;
        assert!(module.matches("loop"));
        assert!(!module.matches("loop0"));
        assert!(!module.matches("ipc:loop"));
    }

    #[test]
    fn test_send_comes_back_in_order() {
        let (_dir, _registry, pool, entry) = open_loop(64);
        assert_eq!(entry.kind(), BackendKind::Loopback);
        entry.start().unwrap();

        let mut pkts = frames(&pool, 5);
        assert_eq!(entry.send(0, &mut pkts).unwrap(), 5);
        assert!(pkts.is_empty());

        let mut out = Vec::new();
        assert_eq!(entry.recv(0, &mut out, 16).unwrap(), 5);
        for (i, pkt) in out.iter().enumerate() {
            assert_eq!(pkt.data(), &[i as u8; 60]);
        }

        let stats = entry.stats().unwrap();
        assert_eq!(stats.out_packets, 5);
        assert_eq!(stats.in_packets, 5);
        assert_eq!(stats.in_octets, 300);
        entry.stats_reset().unwrap();
        assert_eq!(entry.stats().unwrap(), StatsSnapshot::default());
    }

    #[test]
    fn test_burst_cap() {
        let (_dir, _registry, pool, entry) = open_loop(64);
        entry.start().unwrap();

        let mut pkts = frames(&pool, 12);
        assert_eq!(entry.send(0, &mut pkts).unwrap(), QUEUE_MULTI_MAX);
        assert_eq!(pkts.len(), 4);
        assert_eq!(pkts[0].data(), &[8u8; 60]);

        let mut out = Vec::new();
        assert_eq!(entry.recv(0, &mut out, 32).unwrap(), QUEUE_MULTI_MAX);
    }

    #[test]
    fn test_full_queue_keeps_unsent() {
        let (_dir, _registry, pool, entry) = open_loop(3);
        entry.start().unwrap();

        let mut pkts = frames(&pool, 5);
        assert_eq!(entry.send(0, &mut pkts).unwrap(), 3);
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].data(), &[3u8; 60]);
        assert_eq!(entry.send(0, &mut pkts).unwrap(), 0);
        assert_eq!(pkts.len(), 2);
    }

    #[test]
    fn test_timestamps_when_configured() {
        let (_dir, _registry, pool, entry) = open_loop(8);
        let mut config = PktioConfig::default();
        config.pktin.ts_all = true;
        entry.config(&config).unwrap();
        entry.start().unwrap();

        let mut pkts = frames(&pool, 1);
        entry.send(0, &mut pkts).unwrap();
        let mut out = Vec::new();
        entry.recv(0, &mut out, 1).unwrap();
        assert!(out[0].timestamp_ns().is_some());
    }

    #[test]
    fn test_outbound_ipsec_resets_subtype() {
        let (_dir, _registry, pool, entry) = open_loop(8);
        entry
            .config(&PktioConfig {
                outbound_ipsec: true,
                ..Default::default()
            })
            .unwrap();
        entry.start().unwrap();

        let mut pkts = frames(&pool, 1);
        pkts[0].set_subtype(PacketSubtype::Ipsec);
        entry.send(0, &mut pkts).unwrap();
        let mut out = Vec::new();
        entry.recv(0, &mut out, 1).unwrap();
        assert_eq!(out[0].subtype(), PacketSubtype::Basic);
    }

    #[test]
    fn test_properties() {
        let (_dir, _registry, _pool, entry) = open_loop(8);
        assert_eq!(entry.mtu().unwrap(), i32::MAX as u32);
        assert_eq!(entry.mac_addr().unwrap(), Some(LOOP_MAC));
        assert_eq!(entry.link_status().unwrap(), LinkStatus::Up);
        assert_eq!(entry.promisc_mode().unwrap(), Some(false));
        entry.promisc_mode_set(true).unwrap();
        assert_eq!(entry.promisc_mode().unwrap(), Some(true));

        let capa = entry.capability().unwrap();
        assert_eq!(capa.max_input_queues, 1);
        assert!(capa.set_op.promisc_mode);
        assert!(capa.config.outbound_ipsec);
        assert_eq!(entry.state(), PktioState::Opened);
    }

    struct Reject;

    impl Classifier for Reject {
        fn classify(&self, _data: &[u8]) -> Result<Classification, ClassifyError> {
            Err(ClassifyError::NoMatch)
        }
    }

    #[test]
    fn test_classification_failure_counts_errors() {
        let (_dir, _registry, pool, entry) = open_loop(8);
        entry.set_classifier(Arc::new(Reject));
        entry.start().unwrap();

        let mut pkts = frames(&pool, 3);
        entry.send(0, &mut pkts).unwrap();
        let mut out = Vec::new();
        assert_eq!(entry.recv(0, &mut out, 8).unwrap(), 0);
        assert!(out.is_empty());
        assert_eq!(entry.stats().unwrap().in_errors, 3);
        assert_eq!(pool.available(), 32);
    }

    #[test]
    fn test_classification_repools() {
        let (dir, _registry, pool, entry) = open_loop(8);
        let ns = pktio_shm::ShmNamespace::new(dir.path());
        let other = Pool::create(&ns, &PoolParams::new("cls", 4, 512)).unwrap();
        entry.set_classifier(Arc::new(ParserClassifier::new(other.clone())));
        entry.start().unwrap();

        // too short for an Ethernet header: dropped
        let mut pkts = vec![pool.alloc_copy(&[0u8; 8]).unwrap()];
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06;
        pkts.push(pool.alloc_copy(&frame).unwrap());
        entry.send(0, &mut pkts).unwrap();

        let mut out = Vec::new();
        assert_eq!(entry.recv(0, &mut out, 8).unwrap(), 1);
        assert!(out[0].pool().ptr_eq(&other));
        assert_ne!(out[0].parsed().flags, 0);
        assert_eq!(entry.stats().unwrap().in_errors, 1);
        assert_eq!(pool.available(), 32);
    }
}
