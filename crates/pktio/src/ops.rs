//! The operations contract every backend implements.
//!
//! A [`PktioModule`] recognizes device names and opens backend instances; a
//! [`PktioOps`] instance is the backend-private state of one open interface.
//! Only `kind`, `recv` and `send` are mandatory. Every other operation has a
//! default returning [`PktioError::Unsupported`], which the generic layer in
//! [`crate::entry`] turns into a no-op or zero result.

use crate::entry::EntryCore;
use crate::error::{PktioError, PktioResult};
use pktio_shm::{Packet, Pool};
use std::fmt;

/// Backend variant behind an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// NIC driver adapter
    HardwareDriver,
    /// In-process loopback
    Loopback,
    /// Creating side of a shared-memory link
    IpcMaster,
    /// Attaching side of a shared-memory link
    IpcSlave,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareDriver => write!(f, "driver"),
            Self::Loopback => write!(f, "loop"),
            Self::IpcMaster => write!(f, "ipc-master"),
            Self::IpcSlave => write!(f, "ipc-slave"),
        }
    }
}

/// Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// Backend cannot tell
    #[default]
    Unknown,
    /// Link down
    Down,
    /// Link up
    Up,
}

/// How received packets reach the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PktinMode {
    /// Application polls input queues directly
    #[default]
    Direct,
    /// A scheduler polls queues; at most one thread polls a queue at a time
    Scheduled,
    /// Packets are delivered into event queues
    Queue,
    /// Input disabled
    Disabled,
}

/// How the application hands packets for transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PktoutMode {
    /// Application sends on output queues directly
    #[default]
    Direct,
    /// Packets are enqueued into event queues
    Queue,
    /// Output disabled
    Disabled,
}

/// Thread-safety promise made by the caller for a set of queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpMode {
    /// Several threads may use the same queue concurrently
    #[default]
    MtSafe,
    /// Each queue is used by one thread at a time
    MtUnsafe,
}

/// Protocols feeding the receive-side flow hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashProto {
    /// IPv4 + UDP
    pub ipv4_udp: bool,
    /// IPv4 + TCP
    pub ipv4_tcp: bool,
    /// IPv4 addresses
    pub ipv4: bool,
    /// IPv6 + UDP
    pub ipv6_udp: bool,
    /// IPv6 + TCP
    pub ipv6_tcp: bool,
    /// IPv6 addresses
    pub ipv6: bool,
}

impl HashProto {
    /// Every supported protocol
    pub const fn all() -> Self {
        Self {
            ipv4_udp: true,
            ipv4_tcp: true,
            ipv4: true,
            ipv6_udp: true,
            ipv6_tcp: true,
            ipv6: true,
        }
    }

    /// True if no protocol is selected
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parameters passed at open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PktioParam {
    /// Input mode
    pub in_mode: PktinMode,
    /// Output mode
    pub out_mode: PktoutMode,
}

/// Input queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktinQueueParam {
    /// Caller's thread-safety promise
    pub op_mode: OpMode,
    /// Spread flows over queues by hash
    pub hash_enable: bool,
    /// Protocols used for the hash
    pub hash_proto: HashProto,
    /// Number of input queues (0 is raised to 1)
    pub num_queues: usize,
}

impl Default for PktinQueueParam {
    fn default() -> Self {
        Self {
            op_mode: OpMode::MtSafe,
            hash_enable: false,
            hash_proto: HashProto::default(),
            num_queues: 1,
        }
    }
}

/// Output queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktoutQueueParam {
    /// Caller's thread-safety promise
    pub op_mode: OpMode,
    /// Number of output queues (0 is raised to 1)
    pub num_queues: usize,
}

impl Default for PktoutQueueParam {
    fn default() -> Self {
        Self {
            op_mode: OpMode::MtSafe,
            num_queues: 1,
        }
    }
}

/// Input timestamping options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PktinConfigOpt {
    /// Timestamp every received packet
    pub ts_all: bool,
    /// Timestamp PTP packets
    pub ts_ptp: bool,
}

impl PktinConfigOpt {
    /// True if any timestamping is requested
    pub fn timestamps(&self) -> bool {
        self.ts_all || self.ts_ptp
    }
}

/// Negotiated interface features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PktioConfig {
    /// Input options
    pub pktin: PktinConfigOpt,
    /// Inbound IPsec post-processing
    pub inbound_ipsec: bool,
    /// Outbound IPsec post-processing
    pub outbound_ipsec: bool,
}

impl PktioConfig {
    /// True if every feature requested here is also set in `supported`
    pub fn is_subset_of(&self, supported: &PktioConfig) -> bool {
        (!self.pktin.ts_all || supported.pktin.ts_all)
            && (!self.pktin.ts_ptp || supported.pktin.ts_ptp)
            && (!self.inbound_ipsec || supported.inbound_ipsec)
            && (!self.outbound_ipsec || supported.outbound_ipsec)
    }
}

/// Settable interface properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOps {
    /// Promiscuous mode can be changed
    pub promisc_mode: bool,
    /// MAC address can be changed
    pub mac_addr: bool,
}

/// What an interface supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Maximum number of input queues
    pub max_input_queues: usize,
    /// Maximum number of output queues
    pub max_output_queues: usize,
    /// Supported features
    pub config: PktioConfig,
    /// Settable properties
    pub set_op: SetOps,
}

impl Default for Capability {
    fn default() -> Self {
        Self {
            max_input_queues: 1,
            max_output_queues: 1,
            config: PktioConfig::default(),
            set_op: SetOps::default(),
        }
    }
}

/// Interface counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Bytes received
    pub in_octets: u64,
    /// Packets received
    pub in_packets: u64,
    /// Received packets dropped without error
    pub in_discards: u64,
    /// Received packets dropped on error
    pub in_errors: u64,
    /// Bytes sent
    pub out_octets: u64,
    /// Packets sent
    pub out_packets: u64,
    /// Outgoing packets dropped without error
    pub out_discards: u64,
    /// Outgoing packets dropped on error
    pub out_errors: u64,
}

/// A backend variant, registered once with the subsystem
pub trait PktioModule: Send + Sync {
    /// Module name
    fn name(&self) -> &'static str;

    /// True if `devname` follows this module's naming convention
    fn matches(&self, devname: &str) -> bool;

    /// Open a backend instance for `devname`.
    ///
    /// `core` is the generic part of the interface being opened; it is in
    /// the `Opening` state and becomes `Opened` only if this succeeds.
    fn open(&self, core: &EntryCore, devname: &str, pool: &Pool)
    -> PktioResult<Box<dyn PktioOps>>;
}

/// Operations of one open interface
///
/// Backends that serialize queue access take the per-queue lock from
/// [`EntryCore::rx_lock`]/[`EntryCore::tx_lock`], which is skipped when the
/// queue was configured lockless.
pub trait PktioOps: Send + Sync {
    /// Backend variant
    fn kind(&self) -> BackendKind;

    /// Receive up to `max` packets from input queue `queue`, appending them
    /// to `out`; returns the number received
    fn recv(
        &self,
        core: &EntryCore,
        queue: usize,
        out: &mut Vec<Packet>,
        max: usize,
    ) -> PktioResult<usize>;

    /// Send packets from the front of `pkts` on output queue `queue`.
    ///
    /// Sent packets are removed from `pkts`; the rest stay with the caller.
    /// Returns the number sent.
    fn send(&self, core: &EntryCore, queue: usize, pkts: &mut Vec<Packet>)
    -> PktioResult<usize>;

    /// Release backend resources
    fn close(&self, _core: &EntryCore) -> PktioResult<()> {
        Ok(())
    }

    /// Start packet flow
    fn start(&self, _core: &EntryCore) -> PktioResult<()> {
        Err(PktioError::Unsupported("start"))
    }

    /// Stop packet flow
    fn stop(&self, _core: &EntryCore) -> PktioResult<()> {
        Err(PktioError::Unsupported("stop"))
    }

    /// Settle after [`PktioOps::stop`], waiting for traffic still in flight.
    ///
    /// Runs without the entry's control lock, so it may overlap a later
    /// start of the same interface.
    fn drain_stopped(&self, _core: &EntryCore) -> PktioResult<()> {
        Err(PktioError::Unsupported("drain_stopped"))
    }

    /// Apply negotiated features
    fn config(&self, _core: &EntryCore, _config: &PktioConfig) -> PktioResult<()> {
        Err(PktioError::Unsupported("config"))
    }

    /// Configure input queues
    fn input_queues_config(&self, _core: &EntryCore, _param: &PktinQueueParam) -> PktioResult<()> {
        Err(PktioError::Unsupported("input_queues_config"))
    }

    /// Configure output queues
    fn output_queues_config(
        &self,
        _core: &EntryCore,
        _param: &PktoutQueueParam,
    ) -> PktioResult<()> {
        Err(PktioError::Unsupported("output_queues_config"))
    }

    /// Report capabilities
    fn capability(&self, _core: &EntryCore) -> PktioResult<Capability> {
        Err(PktioError::Unsupported("capability"))
    }

    /// Report counters
    fn stats(&self, _core: &EntryCore) -> PktioResult<StatsSnapshot> {
        Err(PktioError::Unsupported("stats"))
    }

    /// Reset counters
    fn stats_reset(&self, _core: &EntryCore) -> PktioResult<()> {
        Err(PktioError::Unsupported("stats_reset"))
    }

    /// Maximum frame length
    fn mtu(&self, _core: &EntryCore) -> PktioResult<u32> {
        Err(PktioError::Unsupported("mtu"))
    }

    /// Enable or disable promiscuous mode
    fn promisc_mode_set(&self, _core: &EntryCore, _enable: bool) -> PktioResult<()> {
        Err(PktioError::Unsupported("promisc_mode_set"))
    }

    /// Current promiscuous mode
    fn promisc_mode(&self, _core: &EntryCore) -> PktioResult<bool> {
        Err(PktioError::Unsupported("promisc_mode"))
    }

    /// Interface MAC address
    fn mac_addr(&self, _core: &EntryCore) -> PktioResult<MacAddr> {
        Err(PktioError::Unsupported("mac_addr"))
    }

    /// Change the MAC address
    fn mac_addr_set(&self, _core: &EntryCore, _mac: MacAddr) -> PktioResult<()> {
        Err(PktioError::Unsupported("mac_addr_set"))
    }

    /// Link state
    fn link_status(&self, _core: &EntryCore) -> PktioResult<LinkStatus> {
        Err(PktioError::Unsupported("link_status"))
    }

    /// Release completed transmissions of output queue `queue`. The caller
    /// holds that queue's transmit lock. Returns the number released.
    fn reclaim_tx(&self, _core: &EntryCore, _queue: usize) -> PktioResult<usize> {
        Err(PktioError::Unsupported("reclaim_tx"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display() {
        let mac = MacAddr([0x02, 0xe9, 0x34, 0x80, 0x73, 0x01]);
        assert_eq!(mac.to_string(), "02:e9:34:80:73:01");
    }

    #[test]
    fn test_config_subset() {
        let supported = PktioConfig {
            pktin: PktinConfigOpt {
                ts_all: true,
                ts_ptp: false,
            },
            inbound_ipsec: false,
            outbound_ipsec: true,
        };
        let mut wanted = PktioConfig::default();
        assert!(wanted.is_subset_of(&supported));
        wanted.pktin.ts_all = true;
        wanted.outbound_ipsec = true;
        assert!(wanted.is_subset_of(&supported));
        wanted.pktin.ts_ptp = true;
        assert!(!wanted.is_subset_of(&supported));
    }

    #[test]
    fn test_hash_proto() {
        assert!(HashProto::default().is_empty());
        assert!(!HashProto::all().is_empty());
    }
}
