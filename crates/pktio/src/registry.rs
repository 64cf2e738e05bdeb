//! Process-wide interface registry.
//!
//! The registry owns the list of backend modules (fixed at construction, in
//! registration order) and every open interface. Entries are looked up by
//! handle or by name; there is no table-wide lock, so operations on
//! different interfaces never contend here.

use crate::config::PktioSubsystemConfig;
use crate::driver::{DriverModule, NicDriver};
use crate::entry::{EntryCore, PktioEntry, PktioHandle, PktioState};
use crate::error::{PktioError, PktioResult};
use crate::ipc::IpcModule;
use crate::loopback::LoopbackModule;
use crate::ops::{BackendKind, PktioModule, PktioParam};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pktio_shm::{Pool, ShmNamespace};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Builder for [`PktioRegistry`]
pub struct PktioRegistryBuilder {
    config: PktioSubsystemConfig,
    drivers: Vec<Arc<dyn NicDriver>>,
    modules: Vec<Box<dyn PktioModule>>,
}

impl PktioRegistryBuilder {
    /// Attach a NIC driver as the next port index (`"0"`, `"1"`, ...)
    pub fn driver(mut self, driver: Arc<dyn NicDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Register an extra backend module, tried after the built-in ones
    pub fn module(mut self, module: Box<dyn PktioModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Validate the configuration and create the registry
    pub fn build(self) -> PktioResult<Arc<PktioRegistry>> {
        self.config.validate()?;

        let mut modules: Vec<Box<dyn PktioModule>> = vec![
            Box::new(DriverModule::new(self.drivers)),
            Box::new(LoopbackModule),
            Box::new(IpcModule),
        ];
        modules.extend(self.modules);

        let ns = self.config.namespace();
        tracing::debug!(
            "pktio subsystem up: modules [{}], shm dir {}",
            modules
                .iter()
                .map(|m| m.name())
                .collect::<Vec<_>>()
                .join(", "),
            ns.dir().display()
        );

        Ok(Arc::new(PktioRegistry {
            config: Arc::new(self.config),
            ns,
            modules,
            entries: DashMap::new(),
            names: DashMap::new(),
            next_handle: AtomicU32::new(1),
        }))
    }
}

/// All open interfaces of this process
pub struct PktioRegistry {
    config: Arc<PktioSubsystemConfig>,
    ns: ShmNamespace,
    modules: Vec<Box<dyn PktioModule>>,
    entries: DashMap<PktioHandle, Arc<PktioEntry>>,
    names: DashMap<String, PktioHandle>,
    next_handle: AtomicU32,
}

impl PktioRegistry {
    /// Start building a registry over `config`
    pub fn builder(config: PktioSubsystemConfig) -> PktioRegistryBuilder {
        PktioRegistryBuilder {
            config,
            drivers: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Registry with the built-in modules and no NIC drivers
    pub fn new(config: PktioSubsystemConfig) -> PktioResult<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Open `devname`, receiving into `pool`.
    ///
    /// Modules recognizing the name are tried in registration order until
    /// one opens it; the error of the last one is returned if none does. The
    /// interface is only registered if a backend open succeeds.
    pub fn open(
        self: &Arc<Self>,
        devname: &str,
        pool: &Pool,
        param: PktioParam,
    ) -> PktioResult<Arc<PktioEntry>> {
        if devname.is_empty() {
            return Err(PktioError::InvalidDevice(devname.to_string()));
        }

        let handle = PktioHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        match self.names.entry(devname.to_string()) {
            Entry::Occupied(_) => return Err(PktioError::AlreadyOpen(devname.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        let core = EntryCore::new(
            devname,
            handle,
            pool.clone(),
            param,
            Arc::clone(&self.config),
            Arc::downgrade(self),
        );

        let mut opened = Err(PktioError::NoModule(devname.to_string()));
        for module in self.modules.iter().filter(|m| m.matches(devname)) {
            opened = module.open(&core, devname, pool);
            match &opened {
                Ok(_) => break,
                Err(e) => tracing::debug!("{}: module {} declined: {}", devname, module.name(), e),
            }
        }

        match opened {
            Ok(ops) => {
                let entry = Arc::new(PktioEntry::new(core, ops));
                self.entries.insert(handle, Arc::clone(&entry));
                tracing::info!(
                    "{}: opened as {} ({}) with pool {}",
                    devname,
                    handle,
                    entry.kind(),
                    pool.name()
                );
                Ok(entry)
            }
            Err(e) => {
                core.set_state(PktioState::Free);
                self.names.remove(devname);
                tracing::error!("{}: open failed: {}", devname, e);
                Err(e)
            }
        }
    }

    /// Close an interface that is not started
    pub fn close(&self, entry: &PktioEntry) -> PktioResult<()> {
        entry.close_backend()?;
        self.entries.remove(&entry.handle());
        self.names.remove(entry.name());
        tracing::info!("{}: closed", entry.name());
        Ok(())
    }

    /// Interface opened under `name`
    pub fn lookup(&self, name: &str) -> Option<Arc<PktioEntry>> {
        let handle = *self.names.get(name)?;
        self.get(handle)
    }

    /// Interface with `handle`
    pub fn get(&self, handle: PktioHandle) -> Option<Arc<PktioEntry>> {
        self.entries.get(&handle).map(|e| Arc::clone(e.value()))
    }

    /// Every open interface
    pub fn entries(&self) -> Vec<Arc<PktioEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of open interfaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no interface is open
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the registered modules, in lookup order
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Subsystem configuration
    pub fn config(&self) -> &PktioSubsystemConfig {
        &self.config
    }

    /// Namespace for shared-memory objects
    pub fn namespace(&self) -> &ShmNamespace {
        &self.ns
    }

    /// Free pool space by forcing transmit completions.
    ///
    /// Reclaims the completions of `origin` first, then visits the other
    /// started driver interfaces, taking each output queue only if its lock
    /// is free, until `origin`'s pool has space again. Returns the number
    /// of completions released.
    pub fn send_completion(&self, origin: PktioHandle) -> usize {
        let Some(own) = self.get(origin) else {
            return 0;
        };
        let pool = own.pool().clone();

        let mut reclaimed = 0;
        for queue in 0..own.core().queue_config().num_out_queues {
            let _guard = own.core().tx_lock(queue);
            reclaimed += own.ops().reclaim_tx(own.core(), queue).unwrap_or(0);
        }

        for entry in self.entries() {
            if pool.available() > 0 {
                break;
            }
            if entry.handle() == origin
                || entry.kind() != BackendKind::HardwareDriver
                || entry.state() != PktioState::Started
                || entry.core().is_lockless_tx()
            {
                continue;
            }
            for queue in 0..entry.core().queue_config().num_out_queues {
                if let Some(_guard) = entry.core().try_tx_lock(queue) {
                    reclaimed += entry.ops().reclaim_tx(entry.core(), queue).unwrap_or(0);
                }
            }
        }

        if reclaimed > 0 {
            tracing::debug!("{}: reclaimed {} transmit completions", own.name(), reclaimed);
        }
        reclaimed
    }
}

impl Drop for PktioRegistry {
    fn drop(&mut self) {
        for entry in self.entries() {
            if entry.state() == PktioState::Started {
                if let Err(e) = entry.stop() {
                    tracing::warn!("{}: stop at shutdown failed: {}", entry.name(), e);
                }
            }
            if let Err(e) = entry.close_backend() {
                tracing::warn!("{}: close at shutdown failed: {}", entry.name(), e);
            }
        }
        self.entries.clear();
        self.names.clear();
    }
}

impl std::fmt::Debug for PktioRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktioRegistry")
            .field("modules", &self.module_names())
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryCore;
    use crate::ops::PktioOps;
    use pktio_shm::{Packet, PoolParams};

    struct Echo;

    impl PktioOps for Echo {
        fn kind(&self) -> BackendKind {
            BackendKind::Loopback
        }

        fn recv(
            &self,
            _core: &EntryCore,
            _queue: usize,
            _out: &mut Vec<Packet>,
            _max: usize,
        ) -> PktioResult<usize> {
            Ok(0)
        }

        fn send(
            &self,
            _core: &EntryCore,
            _queue: usize,
            _pkts: &mut Vec<Packet>,
        ) -> PktioResult<usize> {
            Ok(0)
        }
    }

    struct EchoModule;

    impl PktioModule for EchoModule {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn matches(&self, devname: &str) -> bool {
            devname.starts_with("echo")
        }

        fn open(
            &self,
            _core: &EntryCore,
            devname: &str,
            _pool: &Pool,
        ) -> PktioResult<Box<dyn PktioOps>> {
            if devname == "echo-broken" {
                return Err(PktioError::InvalidDevice(devname.to_string()));
            }
            Ok(Box::new(Echo))
        }
    }

    /// Opens what [`EchoModule`] refuses
    struct FallbackModule;

    impl PktioModule for FallbackModule {
        fn name(&self) -> &'static str {
            "fallback"
        }

        fn matches(&self, devname: &str) -> bool {
            devname.starts_with("echo") || devname.starts_with("ipc")
        }

        fn open(
            &self,
            _core: &EntryCore,
            devname: &str,
            _pool: &Pool,
        ) -> PktioResult<Box<dyn PktioOps>> {
            if devname.ends_with("broken") {
                return Ok(Box::new(Echo));
            }
            Err(PktioError::Driver(format!("{devname}: not handled")))
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<PktioRegistry>, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let config = PktioSubsystemConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let registry = PktioRegistry::builder(config)
            .module(Box::new(EchoModule))
            .build()
            .unwrap();
        let pool = Pool::create(registry.namespace(), &PoolParams::new("reg", 8, 256)).unwrap();
        (dir, registry, pool)
    }

    #[test]
    fn test_module_order() {
        let (_dir, registry, _pool) = setup();
        assert_eq!(
            registry.module_names(),
            vec!["driver", "loop", "ipc", "echo"]
        );
    }

    #[test]
    fn test_open_lookup_close() {
        let (_dir, registry, pool) = setup();
        let entry = registry.open("echo0", &pool, PktioParam::default()).unwrap();
        assert_eq!(entry.state(), PktioState::Opened);
        assert_eq!(registry.len(), 1);

        let found = registry.lookup("echo0").unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        assert!(registry.get(entry.handle()).is_some());

        registry.close(&entry).unwrap();
        assert_eq!(entry.state(), PktioState::Free);
        assert!(registry.lookup("echo0").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (_dir, registry, pool) = setup();
        let _entry = registry.open("echo0", &pool, PktioParam::default()).unwrap();
        assert!(matches!(
            registry.open("echo0", &pool, PktioParam::default()),
            Err(PktioError::AlreadyOpen(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_open_not_registered() {
        let (_dir, registry, pool) = setup();
        assert!(registry.open("echo-broken", &pool, PktioParam::default()).is_err());
        assert!(registry.lookup("echo-broken").is_none());
        assert!(matches!(
            registry.open("nothing-matches", &pool, PktioParam::default()),
            Err(PktioError::NoModule(_))
        ));
        assert!(matches!(
            registry.open("", &pool, PktioParam::default()),
            Err(PktioError::InvalidDevice(_))
        ));
        // name is free again after the failure
        assert!(registry.names.is_empty());
    }

    #[test]
    fn test_open_tries_every_matching_module() {
        let dir = tempfile::tempdir().unwrap();
        let config = PktioSubsystemConfig {
            shm_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let registry = PktioRegistry::builder(config)
            .module(Box::new(EchoModule))
            .module(Box::new(FallbackModule))
            .build()
            .unwrap();
        let pool = Pool::create(registry.namespace(), &PoolParams::new("reg", 8, 256)).unwrap();

        // refused by echo, opened by the module after it
        let entry = registry
            .open("echo-broken", &pool, PktioParam::default())
            .unwrap();
        assert_eq!(entry.state(), PktioState::Opened);

        // the ipc module refuses an overlong name before the fallback is asked
        let long = "ipc:this_name_is_far_too_long_broken";
        assert!(registry.open(long, &pool, PktioParam::default()).is_ok());

        // every matching module failed: the last error is reported
        assert!(matches!(
            registry.open("ipc:this_name_is_far_too_long", &pool, PktioParam::default()),
            Err(PktioError::Driver(_))
        ));
        assert!(registry.lookup("ipc:this_name_is_far_too_long").is_none());
    }

    #[test]
    fn test_close_started_rejected() {
        let (_dir, registry, pool) = setup();
        let entry = registry.open("echo1", &pool, PktioParam::default()).unwrap();
        entry.start().unwrap();
        assert!(matches!(
            registry.close(&entry),
            Err(PktioError::InvalidState { op: "close", .. })
        ));
        entry.stop().unwrap();
        registry.close(&entry).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PktioSubsystemConfig::default();
        config.max_queues = 0;
        assert!(PktioRegistry::new(config).is_err());
    }
}
