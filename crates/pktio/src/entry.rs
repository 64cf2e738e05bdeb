//! Generic per-interface state and the lifecycle discipline.
//!
//! A [`PktioEntry`] pairs the backend-independent [`EntryCore`] with the
//! backend instance chosen at open. Every public operation goes through the
//! entry, which checks the lifecycle state, validates queue indices and
//! turns "unsupported" backend answers into their documented neutral
//! results. Control operations (start, stop, configuration) are serialized
//! per entry; receive and send are not, backends lock queues themselves
//! through [`EntryCore::rx_lock`] and [`EntryCore::tx_lock`].

use crate::classify::Classifier;
use crate::config::PktioSubsystemConfig;
use crate::error::{PktioError, PktioResult};
use crate::lock::{QueueGuard, QueueLocks};
use crate::ops::{
    BackendKind, Capability, HashProto, LinkStatus, MacAddr, OpMode, PktinMode, PktinQueueParam,
    PktioConfig, PktioOps, PktioParam, PktoutMode, PktoutQueueParam, StatsSnapshot,
};
use crate::registry::PktioRegistry;
use pktio_shm::{Packet, Pool, ShmNamespace};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PktioState {
    /// Not in use
    Free = 0,
    /// Backend open in progress
    Opening = 1,
    /// Open, not started
    Opened = 2,
    /// Packet flow running
    Started = 3,
    /// Packet flow stopped
    Stopped = 4,
}

impl PktioState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Opening,
            2 => Self::Opened,
            3 => Self::Started,
            4 => Self::Stopped,
            _ => Self::Free,
        }
    }
}

impl fmt::Display for PktioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Opening => write!(f, "opening"),
            Self::Opened => write!(f, "opened"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Registry-assigned interface identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PktioHandle(pub u32);

impl fmt::Display for PktioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pktio#{}", self.0)
    }
}

/// Generic interface counters
#[derive(Debug, Default)]
pub struct PktioStats {
    in_octets: AtomicU64,
    in_packets: AtomicU64,
    in_discards: AtomicU64,
    in_errors: AtomicU64,
    out_octets: AtomicU64,
    out_packets: AtomicU64,
    out_discards: AtomicU64,
    out_errors: AtomicU64,
}

impl PktioStats {
    /// Count `packets` received totalling `octets` bytes
    pub fn record_rx(&self, packets: u64, octets: u64) {
        self.in_packets.fetch_add(packets, Ordering::Relaxed);
        self.in_octets.fetch_add(octets, Ordering::Relaxed);
    }

    /// Count `packets` sent totalling `octets` bytes
    pub fn record_tx(&self, packets: u64, octets: u64) {
        self.out_packets.fetch_add(packets, Ordering::Relaxed);
        self.out_octets.fetch_add(octets, Ordering::Relaxed);
    }

    /// Count received packets dropped on error
    pub fn record_in_errors(&self, n: u64) {
        self.in_errors.fetch_add(n, Ordering::Relaxed);
    }

    /// Count received packets dropped without error
    pub fn record_in_discards(&self, n: u64) {
        self.in_discards.fetch_add(n, Ordering::Relaxed);
    }

    /// Count outgoing packets dropped on error
    pub fn record_out_errors(&self, n: u64) {
        self.out_errors.fetch_add(n, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_octets: self.in_octets.load(Ordering::Relaxed),
            in_packets: self.in_packets.load(Ordering::Relaxed),
            in_discards: self.in_discards.load(Ordering::Relaxed),
            in_errors: self.in_errors.load(Ordering::Relaxed),
            out_octets: self.out_octets.load(Ordering::Relaxed),
            out_packets: self.out_packets.load(Ordering::Relaxed),
            out_discards: self.out_discards.load(Ordering::Relaxed),
            out_errors: self.out_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.in_octets,
            &self.in_packets,
            &self.in_discards,
            &self.in_errors,
            &self.out_octets,
            &self.out_packets,
            &self.out_discards,
            &self.out_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Queue layout chosen at queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of input queues
    pub num_in_queues: usize,
    /// Number of output queues
    pub num_out_queues: usize,
    /// Receive hash protocols
    pub hash_proto: HashProto,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_in_queues: 1,
            num_out_queues: 1,
            hash_proto: HashProto::all(),
        }
    }
}

/// Backend-independent part of an interface, shared with the backend
pub struct EntryCore {
    name: String,
    handle: PktioHandle,
    param: PktioParam,
    state: AtomicU8,
    ctrl: spin::Mutex<()>,
    stats: PktioStats,
    pool: Pool,
    subsystem: Arc<PktioSubsystemConfig>,
    ns: ShmNamespace,
    config: spin::RwLock<PktioConfig>,
    queues: spin::RwLock<QueueConfig>,
    lockless_rx: AtomicBool,
    lockless_tx: AtomicBool,
    locks: QueueLocks,
    classifier: spin::RwLock<Option<Arc<dyn Classifier>>>,
    registry: Weak<PktioRegistry>,
}

impl EntryCore {
    pub(crate) fn new(
        name: &str,
        handle: PktioHandle,
        pool: Pool,
        param: PktioParam,
        subsystem: Arc<PktioSubsystemConfig>,
        registry: Weak<PktioRegistry>,
    ) -> Self {
        let ns = subsystem.namespace();
        let locks = QueueLocks::new(subsystem.max_queues);
        Self {
            name: name.to_string(),
            handle,
            param,
            state: AtomicU8::new(PktioState::Opening as u8),
            ctrl: spin::Mutex::new(()),
            stats: PktioStats::default(),
            pool,
            subsystem,
            ns,
            config: spin::RwLock::new(PktioConfig::default()),
            queues: spin::RwLock::new(QueueConfig::default()),
            lockless_rx: AtomicBool::new(false),
            lockless_tx: AtomicBool::new(false),
            locks,
            classifier: spin::RwLock::new(None),
            registry,
        }
    }

    /// Device name given at open
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry handle
    pub fn handle(&self) -> PktioHandle {
        self.handle
    }

    /// Modes given at open
    pub fn param(&self) -> PktioParam {
        self.param
    }

    /// Current lifecycle state
    pub fn state(&self) -> PktioState {
        PktioState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PktioState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Generic counters
    pub fn stats(&self) -> &PktioStats {
        &self.stats
    }

    /// Pool the interface receives into
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Subsystem configuration
    pub fn subsystem(&self) -> &PktioSubsystemConfig {
        &self.subsystem
    }

    /// Namespace for shared-memory objects
    pub fn namespace(&self) -> &ShmNamespace {
        &self.ns
    }

    /// Features applied with [`PktioEntry::config`]
    pub fn config(&self) -> PktioConfig {
        *self.config.read()
    }

    /// Current queue layout
    pub fn queue_config(&self) -> QueueConfig {
        *self.queues.read()
    }

    /// True if input queues are polled without locking
    pub fn is_lockless_rx(&self) -> bool {
        self.lockless_rx.load(Ordering::Acquire)
    }

    /// True if output queues are fed without locking
    pub fn is_lockless_tx(&self) -> bool {
        self.lockless_tx.load(Ordering::Acquire)
    }

    /// Lock input queue `queue`, unless input is lockless
    pub fn rx_lock(&self, queue: usize) -> Option<QueueGuard<'_>> {
        if self.is_lockless_rx() {
            return None;
        }
        self.locks.lock_rx(queue)
    }

    /// Lock output queue `queue`, unless output is lockless
    pub fn tx_lock(&self, queue: usize) -> Option<QueueGuard<'_>> {
        if self.is_lockless_tx() {
            return None;
        }
        self.locks.lock_tx(queue)
    }

    /// Take output queue `queue` if it is free right now
    pub fn try_tx_lock(&self, queue: usize) -> Option<QueueGuard<'_>> {
        self.locks.try_lock_tx(queue)
    }

    /// Installed classifier, if any
    pub fn classifier(&self) -> Option<Arc<dyn Classifier>> {
        self.classifier.read().clone()
    }

    /// Owning registry, while it is alive
    pub fn registry(&self) -> Option<Arc<PktioRegistry>> {
        self.registry.upgrade()
    }
}

impl fmt::Debug for EntryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCore")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .field("pool", &self.pool.name())
            .finish()
    }
}

/// Wall-clock timestamp for received packets
pub fn timestamp_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn or_unsupported<T>(result: PktioResult<T>, fallback: impl FnOnce() -> T) -> PktioResult<T> {
    match result {
        Err(PktioError::Unsupported(_)) => Ok(fallback()),
        other => other,
    }
}

/// An open interface
pub struct PktioEntry {
    core: EntryCore,
    ops: Box<dyn PktioOps>,
}

impl PktioEntry {
    pub(crate) fn new(core: EntryCore, ops: Box<dyn PktioOps>) -> Self {
        core.set_state(PktioState::Opened);
        Self { core, ops }
    }

    /// Generic state shared with the backend
    pub fn core(&self) -> &EntryCore {
        &self.core
    }

    pub(crate) fn ops(&self) -> &dyn PktioOps {
        self.ops.as_ref()
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Registry handle
    pub fn handle(&self) -> PktioHandle {
        self.core.handle()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PktioState {
        self.core.state()
    }

    /// Backend variant
    pub fn kind(&self) -> BackendKind {
        self.ops.kind()
    }

    /// Pool the interface receives into
    pub fn pool(&self) -> &Pool {
        self.core.pool()
    }

    fn invalid_state(&self, op: &'static str) -> PktioError {
        PktioError::InvalidState {
            name: self.name().to_string(),
            op,
            state: self.state(),
        }
    }

    fn require_configurable(&self, op: &'static str) -> PktioResult<()> {
        match self.state() {
            PktioState::Opened | PktioState::Stopped => Ok(()),
            _ => Err(self.invalid_state(op)),
        }
    }

    /// Start packet flow
    pub fn start(&self) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        match self.state() {
            PktioState::Opened | PktioState::Stopped => {}
            _ => return Err(self.invalid_state("start")),
        }
        or_unsupported(self.ops.start(&self.core), || ())?;
        self.core.set_state(PktioState::Started);
        tracing::info!("{}: started", self.name());
        Ok(())
    }

    /// Stop packet flow.
    ///
    /// The entry is STOPPED once the backend stopped; waiting for packets
    /// still in flight happens after the control lock is released.
    pub fn stop(&self) -> PktioResult<()> {
        {
            let _ctrl = self.core.ctrl.lock();
            if self.state() != PktioState::Started {
                return Err(self.invalid_state("stop"));
            }
            or_unsupported(self.ops.stop(&self.core), || ())?;
            self.core.set_state(PktioState::Stopped);
        }
        or_unsupported(self.ops.drain_stopped(&self.core), || ())?;
        tracing::info!("{}: stopped", self.name());
        Ok(())
    }

    pub(crate) fn close_backend(&self) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        match self.state() {
            PktioState::Opened | PktioState::Stopped => {}
            _ => return Err(self.invalid_state("close")),
        }
        self.ops.close(&self.core)?;
        self.core.set_state(PktioState::Free);
        Ok(())
    }

    /// Apply negotiated features; each must be in the capability set
    pub fn config(&self, config: &PktioConfig) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        self.require_configurable("config")?;
        let capa = self.capability_inner()?;
        if !config.is_subset_of(&capa.config) {
            tracing::error!("{}: unsupported configuration {:?}", self.name(), config);
            return Err(PktioError::InvalidConfig(format!(
                "{}: requested features not supported",
                self.name()
            )));
        }
        or_unsupported(self.ops.config(&self.core, config), || ())?;
        *self.core.config.write() = *config;
        Ok(())
    }

    /// Features currently applied
    pub fn current_config(&self) -> PktioConfig {
        self.core.config()
    }

    /// Configure input queues and decide on receive locking
    pub fn input_queues_config(&self, param: &PktinQueueParam) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        self.require_configurable("input_queues_config")?;

        let mode = self.core.param.in_mode;
        if mode == PktinMode::Disabled {
            self.core.queues.write().num_in_queues = 0;
            return Ok(());
        }

        let mut param = *param;
        param.num_queues = param.num_queues.max(1);
        let capa = self.capability_inner()?;
        if param.num_queues > capa.max_input_queues || param.num_queues > self.core.locks.len() {
            tracing::error!(
                "{}: {} input queues requested, max {}",
                self.name(),
                param.num_queues,
                capa.max_input_queues.min(self.core.locks.len())
            );
            return Err(PktioError::InvalidConfig(format!(
                "{}: too many input queues ({})",
                self.name(),
                param.num_queues
            )));
        }
        if !(param.hash_enable && param.num_queues > 1) {
            param.hash_proto = HashProto::all();
        }

        let lockless = mode == PktinMode::Scheduled || param.op_mode == OpMode::MtUnsafe;
        self.core.lockless_rx.store(lockless, Ordering::Release);
        or_unsupported(self.ops.input_queues_config(&self.core, &param), || ())?;

        let mut queues = self.core.queues.write();
        queues.num_in_queues = param.num_queues;
        queues.hash_proto = param.hash_proto;
        Ok(())
    }

    /// Configure output queues and decide on transmit locking
    pub fn output_queues_config(&self, param: &PktoutQueueParam) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        self.require_configurable("output_queues_config")?;

        if self.core.param.out_mode == PktoutMode::Disabled {
            self.core.queues.write().num_out_queues = 0;
            return Ok(());
        }

        let mut param = *param;
        param.num_queues = param.num_queues.max(1);
        let capa = self.capability_inner()?;
        if param.num_queues > capa.max_output_queues || param.num_queues > self.core.locks.len()
        {
            tracing::error!(
                "{}: {} output queues requested, max {}",
                self.name(),
                param.num_queues,
                capa.max_output_queues.min(self.core.locks.len())
            );
            return Err(PktioError::InvalidConfig(format!(
                "{}: too many output queues ({})",
                self.name(),
                param.num_queues
            )));
        }

        self.core
            .lockless_tx
            .store(param.op_mode == OpMode::MtUnsafe, Ordering::Release);
        or_unsupported(self.ops.output_queues_config(&self.core, &param), || ())?;

        self.core.queues.write().num_out_queues = param.num_queues;
        Ok(())
    }

    fn capability_inner(&self) -> PktioResult<Capability> {
        or_unsupported(self.ops.capability(&self.core), Capability::default)
    }

    /// What the interface supports
    pub fn capability(&self) -> PktioResult<Capability> {
        self.capability_inner()
    }

    /// Receive up to `max` packets from input queue `queue` into `out`.
    ///
    /// Returns 0 unless the interface is started.
    pub fn recv(&self, queue: usize, out: &mut Vec<Packet>, max: usize) -> PktioResult<usize> {
        if self.state() != PktioState::Started {
            return Ok(0);
        }
        let num = self.core.queue_config().num_in_queues;
        if queue >= num {
            return Err(PktioError::InvalidQueue { index: queue, max: num });
        }
        if max == 0 {
            return Ok(0);
        }
        self.ops.recv(&self.core, queue, out, max)
    }

    /// Send packets from the front of `pkts` on output queue `queue`.
    ///
    /// Sent packets leave `pkts`; returns how many. Returns 0 unless the
    /// interface is started.
    pub fn send(&self, queue: usize, pkts: &mut Vec<Packet>) -> PktioResult<usize> {
        if self.state() != PktioState::Started {
            return Ok(0);
        }
        let num = self.core.queue_config().num_out_queues;
        if queue >= num {
            return Err(PktioError::InvalidQueue { index: queue, max: num });
        }
        if pkts.is_empty() {
            return Ok(0);
        }
        self.ops.send(&self.core, queue, pkts)
    }

    /// Counters, from the backend when it keeps its own
    pub fn stats(&self) -> PktioResult<StatsSnapshot> {
        or_unsupported(self.ops.stats(&self.core), || self.core.stats.snapshot())
    }

    /// Zero the counters
    pub fn stats_reset(&self) -> PktioResult<()> {
        self.core.stats.reset();
        or_unsupported(self.ops.stats_reset(&self.core), || ())
    }

    /// Maximum frame length, 0 when unknown
    pub fn mtu(&self) -> PktioResult<u32> {
        or_unsupported(self.ops.mtu(&self.core), || 0)
    }

    /// Enable or disable promiscuous mode
    pub fn promisc_mode_set(&self, enable: bool) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        or_unsupported(self.ops.promisc_mode_set(&self.core, enable), || ())
    }

    /// Promiscuous mode, `None` when unknown
    pub fn promisc_mode(&self) -> PktioResult<Option<bool>> {
        or_unsupported(self.ops.promisc_mode(&self.core).map(Some), || None)
    }

    /// MAC address, `None` when unknown
    pub fn mac_addr(&self) -> PktioResult<Option<MacAddr>> {
        or_unsupported(self.ops.mac_addr(&self.core).map(Some), || None)
    }

    /// Change the MAC address
    pub fn mac_addr_set(&self, mac: MacAddr) -> PktioResult<()> {
        let _ctrl = self.core.ctrl.lock();
        or_unsupported(self.ops.mac_addr_set(&self.core, mac), || ())
    }

    /// Link state
    pub fn link_status(&self) -> PktioResult<LinkStatus> {
        or_unsupported(self.ops.link_status(&self.core), || LinkStatus::Unknown)
    }

    /// Run every received packet through `classifier`
    pub fn set_classifier(&self, classifier: Arc<dyn Classifier>) {
        *self.core.classifier.write() = Some(classifier);
    }

    /// Stop classifying received packets
    pub fn clear_classifier(&self) {
        *self.core.classifier.write() = None;
    }
}

impl fmt::Debug for PktioEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PktioEntry")
            .field("name", &self.name())
            .field("handle", &self.handle())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}
