//! NIC driver backend.
//!
//! Devices named by a port index (`"0"`, `"1"`, ...) are served by a
//! [`NicDriver`] registered with the subsystem. The driver trait is the
//! boundary to a vendor packet-I/O library: device configuration, burst
//! receive, burst transmit and transmit-completion reclamation. The backend
//! adds what the contract needs on top: per-queue locking, minimum receive
//! bursts, classification and send-completion recovery when the receive pool
//! runs dry.
//!
//! [`VirtualNic`] is a software driver with injectable receive queues and
//! transmit completions that are held until reclaimed.

use crate::classify::classify_received;
use crate::entry::{EntryCore, timestamp_now_ns};
use crate::error::{PktioError, PktioResult};
use crate::ops::{
    BackendKind, Capability, HashProto, LinkStatus, MacAddr, PktinConfigOpt, PktioConfig,
    PktioModule, PktioOps, SetOps, StatsSnapshot,
};
use pktio_shm::{Packet, Pool};
use std::collections::VecDeque;
use std::sync::Arc;

/// Static properties of a NIC port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    /// Driver name; empty when no driver is bound to the port
    pub driver_name: String,
    /// Receive queues the hardware offers
    pub max_rx_queues: usize,
    /// Transmit queues the hardware offers
    pub max_tx_queues: usize,
    /// Smallest receive burst the driver accepts (0 for none)
    pub min_rx_burst: usize,
    /// Port MAC address
    pub mac: MacAddr,
}

/// Device configuration applied at start
#[derive(Debug, Clone)]
pub struct DeviceConf {
    /// Receive queues to set up
    pub num_rx_queues: usize,
    /// Transmit queues to set up
    pub num_tx_queues: usize,
    /// Protocols for receive-side scaling
    pub rss: HashProto,
    /// Pool received frames are stored in
    pub pool: Pool,
}

/// Vendor driver boundary
pub trait NicDriver: Send + Sync {
    /// Port properties
    fn info(&self) -> NicInfo;

    /// Set up queues; called before every start
    fn configure(&self, conf: &DeviceConf) -> PktioResult<()>;

    /// Start the port
    fn start(&self) -> PktioResult<()>;

    /// Stop the port
    fn stop(&self) -> PktioResult<()>;

    /// Release the port
    fn close(&self) -> PktioResult<()>;

    /// Receive up to `max` frames of queue `queue` into `out`
    fn rx_burst(&self, queue: usize, out: &mut Vec<Packet>, max: usize) -> usize;

    /// Hand packets from the front of `pkts` to queue `queue`; sent packets
    /// leave `pkts`
    fn tx_burst(&self, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize>;

    /// Release buffers of completed transmissions on queue `queue`
    fn reclaim_tx(&self, queue: usize) -> usize;

    /// Hardware counters
    fn stats(&self) -> StatsSnapshot;

    /// Zero hardware counters
    fn stats_reset(&self);

    /// Port MTU, 0 when unknown
    fn mtu(&self) -> u32;

    /// Promiscuous mode
    fn promiscuous(&self) -> bool;

    /// Change promiscuous mode
    fn set_promiscuous(&self, enable: bool) -> PktioResult<()>;

    /// True if the link is up
    fn link_up(&self) -> bool;
}

/// True for names made of ASCII digits only
fn is_port_name(devname: &str) -> bool {
    !devname.is_empty() && devname.bytes().all(|b| b.is_ascii_digit())
}

/// Opens NIC ports by index
pub struct DriverModule {
    drivers: Vec<Arc<dyn NicDriver>>,
}

impl DriverModule {
    /// Module serving `drivers`, port `i` being `drivers[i]`
    pub fn new(drivers: Vec<Arc<dyn NicDriver>>) -> Self {
        Self { drivers }
    }
}

impl PktioModule for DriverModule {
    fn name(&self) -> &'static str {
        "driver"
    }

    fn matches(&self, devname: &str) -> bool {
        is_port_name(devname)
    }

    fn open(
        &self,
        core: &EntryCore,
        devname: &str,
        _pool: &Pool,
    ) -> PktioResult<Box<dyn PktioOps>> {
        let port: usize = devname
            .parse()
            .map_err(|_| PktioError::InvalidDevice(devname.to_string()))?;
        let driver = self
            .drivers
            .get(port)
            .cloned()
            .ok_or_else(|| PktioError::InvalidDevice(format!("no NIC at port {port}")))?;

        let info = driver.info();
        if info.driver_name.is_empty() {
            tracing::debug!("No driver found for interface: {}", devname);
            return Err(PktioError::InvalidDevice(devname.to_string()));
        }
        tracing::info!(
            "Port {} ({}): MAC {}, {} rx / {} tx queues",
            port,
            info.driver_name,
            info.mac,
            info.max_rx_queues,
            info.max_tx_queues
        );

        let max_queues = core.subsystem().max_queues;
        let capa = Capability {
            max_input_queues: info.max_rx_queues.min(max_queues),
            max_output_queues: info.max_tx_queues.min(max_queues),
            config: PktioConfig {
                pktin: PktinConfigOpt {
                    ts_all: true,
                    ts_ptp: true,
                },
                inbound_ipsec: false,
                outbound_ipsec: false,
            },
            set_op: SetOps {
                promisc_mode: true,
                mac_addr: false,
            },
        };

        Ok(Box::new(DriverPort {
            port,
            driver,
            info,
            capa,
        }))
    }
}

/// State of an open NIC port
struct DriverPort {
    port: usize,
    driver: Arc<dyn NicDriver>,
    info: NicInfo,
    capa: Capability,
}

impl PktioOps for DriverPort {
    fn kind(&self) -> BackendKind {
        BackendKind::HardwareDriver
    }

    fn recv(
        &self,
        core: &EntryCore,
        queue: usize,
        out: &mut Vec<Packet>,
        max: usize,
    ) -> PktioResult<usize> {
        let min = self.info.min_rx_burst;
        let start = out.len();

        let received = {
            let _guard = core.rx_lock(queue);
            if min > max {
                tracing::debug!(
                    "Port {} requires >{} buffers burst, asked for {}",
                    self.port,
                    min,
                    max
                );
                let mut scratch = Vec::with_capacity(min);
                let n = self.driver.rx_burst(queue, &mut scratch, min);
                let dropped = n.saturating_sub(max);
                scratch.truncate(max);
                out.append(&mut scratch);
                if dropped > 0 {
                    core.stats().record_in_discards(dropped as u64);
                }
                n.min(max)
            } else {
                self.driver.rx_burst(queue, out, max)
            }
        };

        if received == 0 && !core.is_lockless_tx() && core.pool().available() == 0 {
            if let Some(registry) = core.registry() {
                registry.send_completion(core.handle());
            }
        }

        if core.config().pktin.timestamps() {
            let ts = timestamp_now_ns();
            for pkt in out[start..].iter_mut().filter(|p| !p.has_ref()) {
                pkt.set_timestamp_ns(ts);
            }
        }

        Ok(classify_received(core, out, start))
    }

    fn send(&self, core: &EntryCore, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize> {
        let sent = {
            let _guard = core.tx_lock(queue);
            self.driver.tx_burst(queue, pkts)?
        };

        if sent == 0 {
            if let Some(first) = pkts.first() {
                let mtu = self.driver.mtu();
                if mtu > 0 && first.len() > mtu as usize {
                    return Err(PktioError::MessageTooLong {
                        len: first.len(),
                        mtu,
                    });
                }
            }
        }
        Ok(sent)
    }

    fn close(&self, _core: &EntryCore) -> PktioResult<()> {
        self.driver.close()
    }

    fn start(&self, core: &EntryCore) -> PktioResult<()> {
        let queues = core.queue_config();
        let conf = DeviceConf {
            num_rx_queues: queues.num_in_queues.max(1),
            num_tx_queues: queues.num_out_queues.max(1),
            rss: queues.hash_proto,
            pool: core.pool().clone(),
        };
        if let Err(e) = self.driver.configure(&conf) {
            tracing::error!("Cannot configure port {}: {}", self.port, e);
            return Err(e);
        }
        self.driver.start()
    }

    fn stop(&self, _core: &EntryCore) -> PktioResult<()> {
        self.driver.stop()
    }

    fn config(&self, _core: &EntryCore, _config: &PktioConfig) -> PktioResult<()> {
        Ok(())
    }

    fn capability(&self, _core: &EntryCore) -> PktioResult<Capability> {
        Ok(self.capa)
    }

    fn stats(&self, core: &EntryCore) -> PktioResult<StatsSnapshot> {
        let mut stats = self.driver.stats();
        let generic = core.stats().snapshot();
        stats.in_errors += generic.in_errors;
        stats.in_discards += generic.in_discards;
        Ok(stats)
    }

    fn stats_reset(&self, _core: &EntryCore) -> PktioResult<()> {
        self.driver.stats_reset();
        Ok(())
    }

    fn mtu(&self, _core: &EntryCore) -> PktioResult<u32> {
        Ok(self.driver.mtu())
    }

    fn promisc_mode_set(&self, _core: &EntryCore, enable: bool) -> PktioResult<()> {
        self.driver.set_promiscuous(enable)
    }

    fn promisc_mode(&self, _core: &EntryCore) -> PktioResult<bool> {
        Ok(self.driver.promiscuous())
    }

    fn mac_addr(&self, _core: &EntryCore) -> PktioResult<MacAddr> {
        Ok(self.info.mac)
    }

    fn link_status(&self, _core: &EntryCore) -> PktioResult<LinkStatus> {
        Ok(if self.driver.link_up() {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        })
    }

    fn reclaim_tx(&self, _core: &EntryCore, queue: usize) -> PktioResult<usize> {
        Ok(self.driver.reclaim_tx(queue))
    }
}

struct VirtualNicState {
    conf: Option<DeviceConf>,
    started: bool,
    rx: Vec<VecDeque<Vec<u8>>>,
    tx_inflight: Vec<Vec<Packet>>,
    transmitted: Vec<Vec<u8>>,
    stats: StatsSnapshot,
    promisc: bool,
    link_up: bool,
}

/// Software NIC.
///
/// Frames injected with [`VirtualNic::inject_rx`] are received into the
/// configured pool. Transmitted packets are copied out for inspection and
/// their buffers stay in flight, up to the transmit ring size, until
/// [`NicDriver::reclaim_tx`] releases them.
pub struct VirtualNic {
    info: NicInfo,
    mtu: u32,
    tx_ring_size: usize,
    state: spin::Mutex<VirtualNicState>,
}

impl VirtualNic {
    /// Single-queue NIC with a 1500-byte MTU
    pub fn new(driver_name: &str) -> Self {
        Self::with_queues(driver_name, 1, 1)
    }

    /// NIC offering `rx` receive and `tx` transmit queues
    pub fn with_queues(driver_name: &str, rx: usize, tx: usize) -> Self {
        Self {
            info: NicInfo {
                driver_name: driver_name.to_string(),
                max_rx_queues: rx,
                max_tx_queues: tx,
                min_rx_burst: 0,
                mac: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            },
            mtu: 1500,
            tx_ring_size: 256,
            state: spin::Mutex::new(VirtualNicState {
                conf: None,
                started: false,
                rx: (0..rx).map(|_| VecDeque::new()).collect(),
                tx_inflight: (0..tx).map(|_| Vec::new()).collect(),
                transmitted: Vec::new(),
                stats: StatsSnapshot::default(),
                promisc: false,
                link_up: true,
            }),
        }
    }

    /// Require receive bursts of at least `min` frames
    pub fn with_min_rx_burst(mut self, min: usize) -> Self {
        self.info.min_rx_burst = min;
        self
    }

    /// Hold at most `size` unreclaimed transmissions per queue
    pub fn with_tx_ring_size(mut self, size: usize) -> Self {
        self.tx_ring_size = size;
        self
    }

    /// Set the port MTU
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the port MAC address
    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.info.mac = mac;
        self
    }

    /// Queue a frame for reception on `queue`; false if the queue does not
    /// exist
    pub fn inject_rx(&self, queue: usize, frame: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.rx.get_mut(queue) {
            Some(rx) => {
                rx.push_back(frame.to_vec());
                true
            }
            None => false,
        }
    }

    /// Frames transmitted since the last call
    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().transmitted)
    }

    /// Unreclaimed transmissions on `queue`
    pub fn pending_tx(&self, queue: usize) -> usize {
        self.state.lock().tx_inflight.get(queue).map_or(0, Vec::len)
    }

    /// Frames waiting to be received on `queue`
    pub fn pending_rx(&self, queue: usize) -> usize {
        self.state.lock().rx.get(queue).map_or(0, VecDeque::len)
    }

    /// Change the link state
    pub fn set_link(&self, up: bool) {
        self.state.lock().link_up = up;
    }

    /// True between start and stop
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Queue counts of the last configuration
    pub fn configured_queues(&self) -> Option<(usize, usize)> {
        self.state
            .lock()
            .conf
            .as_ref()
            .map(|c| (c.num_rx_queues, c.num_tx_queues))
    }
}

impl NicDriver for VirtualNic {
    fn info(&self) -> NicInfo {
        self.info.clone()
    }

    fn configure(&self, conf: &DeviceConf) -> PktioResult<()> {
        if conf.num_rx_queues > self.info.max_rx_queues
            || conf.num_tx_queues > self.info.max_tx_queues
        {
            return Err(PktioError::Driver(format!(
                "{}: {} rx / {} tx queues not available",
                self.info.driver_name, conf.num_rx_queues, conf.num_tx_queues
            )));
        }
        self.state.lock().conf = Some(conf.clone());
        Ok(())
    }

    fn start(&self) -> PktioResult<()> {
        let mut state = self.state.lock();
        if state.conf.is_none() {
            return Err(PktioError::Driver(format!(
                "{}: start before configure",
                self.info.driver_name
            )));
        }
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> PktioResult<()> {
        self.state.lock().started = false;
        Ok(())
    }

    fn close(&self) -> PktioResult<()> {
        let mut state = self.state.lock();
        state.started = false;
        state.conf = None;
        for inflight in &mut state.tx_inflight {
            inflight.clear();
        }
        Ok(())
    }

    fn rx_burst(&self, queue: usize, out: &mut Vec<Packet>, max: usize) -> usize {
        let mut state = self.state.lock();
        if !state.started || !state.link_up {
            return 0;
        }
        let Some(pool) = state.conf.as_ref().map(|c| c.pool.clone()) else {
            return 0;
        };

        let mut n = 0;
        let mut octets = 0;
        while n < max {
            let Some(frame) = state.rx.get_mut(queue).and_then(VecDeque::pop_front) else {
                break;
            };
            match pool.alloc_copy(&frame) {
                Some(pkt) => {
                    octets += frame.len();
                    out.push(pkt);
                    n += 1;
                }
                None => {
                    // no buffer: leave the frame on the wire queue
                    if let Some(rx) = state.rx.get_mut(queue) {
                        rx.push_front(frame);
                    }
                    break;
                }
            }
        }
        state.stats.in_packets += n as u64;
        state.stats.in_octets += octets as u64;
        n
    }

    fn tx_burst(&self, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(PktioError::Driver(format!(
                "{}: transmit while stopped",
                self.info.driver_name
            )));
        }
        let Some(inflight) = state.tx_inflight.get(queue) else {
            return Err(PktioError::InvalidQueue {
                index: queue,
                max: self.info.max_tx_queues,
            });
        };

        let room = self.tx_ring_size.saturating_sub(inflight.len());
        let n = pkts
            .iter()
            .take(room)
            .take_while(|p| p.len() <= self.mtu as usize)
            .count();

        let mut octets = 0;
        for pkt in pkts.drain(..n) {
            octets += pkt.len();
            state.transmitted.push(pkt.data().to_vec());
            state.tx_inflight[queue].push(pkt);
        }
        state.stats.out_packets += n as u64;
        state.stats.out_octets += octets as u64;
        Ok(n)
    }

    fn reclaim_tx(&self, queue: usize) -> usize {
        let mut state = self.state.lock();
        state
            .tx_inflight
            .get_mut(queue)
            .map_or(0, |inflight| inflight.drain(..).count())
    }

    fn stats(&self) -> StatsSnapshot {
        self.state.lock().stats
    }

    fn stats_reset(&self) {
        self.state.lock().stats = StatsSnapshot::default();
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn promiscuous(&self) -> bool {
        self.state.lock().promisc
    }

    fn set_promiscuous(&self, enable: bool) -> PktioResult<()> {
        self.state.lock().promisc = enable;
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.state.lock().link_up
    }
}
