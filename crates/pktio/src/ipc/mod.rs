//! Shared-memory link between two processes.
//!
//! The master opens `ipc:<name>` and creates the link objects under its own
//! pid. The slave opens `ipc:<master pid>:<name>` and maps them. Both sides
//! must be started before packets flow; the slave starts first.

pub mod info;
pub mod link;

pub use info::{IpcInfoSnapshot, PeerSnapshot};
pub use link::{IPC_MAC, IPC_MTU, IpcLink, IpcRole};

use crate::entry::EntryCore;
use crate::error::{PktioError, PktioResult};
use crate::ops::{PktioModule, PktioOps};
use info::InfoBlock;
use pktio_shm::{Pool, SHM_NAME_LEN, ShmNamespace};

/// Device name prefix handled by [`IpcModule`]
pub const IPC_PREFIX: &str = "ipc";

/// Longest link name that leaves room for every object suffix
pub const IPC_DEV_MAX: usize = SHM_NAME_LEN - link::M_PROD.len() - 1;

/// Parsed IPC device name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcName {
    /// `ipc:<name>`, or any other name starting with `ipc`
    Master {
        /// Link name
        dev: String,
    },
    /// `ipc:<pid>:<name>`
    Slave {
        /// Link name as the master opened it (`ipc:<name>`)
        dev: String,
        /// Master process id
        master_pid: u32,
    },
}

impl IpcName {
    /// Classify `devname` and check that its object names fit
    pub fn parse(devname: &str) -> PktioResult<Self> {
        let slave = devname
            .strip_prefix("ipc:")
            .and_then(|rest| rest.split_once(':'))
            .and_then(|(pid, tail)| {
                let pid = pid.parse::<u32>().ok()?;
                (!tail.is_empty()).then(|| (pid, format!("ipc:{tail}")))
            });
        let name = match slave {
            Some((master_pid, dev)) => Self::Slave { dev, master_pid },
            None => Self::Master {
                dev: devname.to_string(),
            },
        };

        if name.dev().len() > IPC_DEV_MAX {
            tracing::error!(
                "{}: link name longer than {} characters",
                devname,
                IPC_DEV_MAX
            );
            return Err(PktioError::InvalidDevice(devname.to_string()));
        }
        Ok(name)
    }

    /// Link name shared by both sides
    pub fn dev(&self) -> &str {
        match self {
            Self::Master { dev } | Self::Slave { dev, .. } => dev,
        }
    }
}

/// Opens `ipc*` devices
#[derive(Debug, Default)]
pub struct IpcModule;

impl PktioModule for IpcModule {
    fn name(&self) -> &'static str {
        "ipc"
    }

    fn matches(&self, devname: &str) -> bool {
        devname.starts_with(IPC_PREFIX)
    }

    fn open(&self, core: &EntryCore, devname: &str, pool: &Pool) -> PktioResult<Box<dyn PktioOps>> {
        let link = match IpcName::parse(devname)? {
            IpcName::Master { dev } => IpcLink::open_master(core, &dev, pool)?,
            IpcName::Slave { dev, master_pid } => {
                IpcLink::open_slave(core, &dev, master_pid, pool)?
            }
        };
        Ok(Box::new(link))
    }
}

/// Read the handshake block of link `dev` created by process `pid`
pub fn read_info(ns: &ShmNamespace, dev: &str, pid: u32) -> PktioResult<IpcInfoSnapshot> {
    Ok(InfoBlock::import(ns, dev, pid)?.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            IpcName::parse("ipc:pktio0").unwrap(),
            IpcName::Master {
                dev: "ipc:pktio0".to_string()
            }
        );
        assert_eq!(
            IpcName::parse("ipc:4242:pktio0").unwrap(),
            IpcName::Slave {
                dev: "ipc:pktio0".to_string(),
                master_pid: 4242
            }
        );
        // a non-numeric middle part is a master name
        assert_eq!(IpcName::parse("ipc:a:b").unwrap().dev(), "ipc:a:b");
        assert_eq!(IpcName::parse("ipc0").unwrap().dev(), "ipc0");
        assert_eq!(IpcName::parse("ipc:12:").unwrap().dev(), "ipc:12:");
    }

    #[test]
    fn test_name_budget() {
        let longest = format!("ipc:{}", "x".repeat(IPC_DEV_MAX - 4));
        assert!(IpcName::parse(&longest).is_ok());

        let too_long = format!("{longest}x");
        assert!(matches!(
            IpcName::parse(&too_long),
            Err(PktioError::InvalidDevice(_))
        ));
        assert!(IpcName::parse(&format!("ipc:1:{}x", "x".repeat(IPC_DEV_MAX - 4))).is_err());
    }

    #[test]
    fn test_matches_prefix() {
        let module = IpcModule;
        assert!(module.matches("ipc:a"));
        assert!(module.matches("ipc"));
        assert!(!module.matches("loop"));
        assert!(!module.matches("0"));
    }

    #[test]
    fn test_read_info_without_link() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        assert!(read_info(&ns, "ipc:none", 1).is_err());
    }

    proptest! {
        #[test]
        fn test_slave_name_names_master_link(pid in any::<u32>(), tail in "[a-z0-9_]{1,20}") {
            let master = IpcName::parse(&format!("ipc:{tail}")).unwrap();
            let slave = IpcName::parse(&format!("ipc:{pid}:{tail}")).unwrap();
            prop_assert_eq!(slave.dev(), master.dev());
            prop_assert_eq!(slave, IpcName::Slave { dev: format!("ipc:{tail}"), master_pid: pid });
        }

        #[test]
        fn test_long_names_rejected(pid in any::<u32>(), tail in "[a-z0-9_]{21,40}") {
            let master_name = format!("ipc:{tail}");
            let slave_name = format!("ipc:{pid}:{tail}");
            prop_assert!(IpcName::parse(&master_name).is_err());
            prop_assert!(IpcName::parse(&slave_name).is_err());
        }
    }
}
