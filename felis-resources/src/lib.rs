//! The resource kinds felis manages on a FreeBSD host, and the collectors
//! that keep their observed fields current.

pub mod check;
pub mod collect;
pub mod jail;
pub mod net;
pub mod rctl;
pub mod size;
pub mod zfs;

use std::{path::PathBuf, sync::Arc, time::Duration};

use felis_ledger::Registry;

use crate::jail::{ConsoleControl, JailConfWriter, PrewrittenJailConf, UnmanagedConsole};

/// Host-specific settings the resource kinds act on.
#[derive(Clone)]
pub struct Config {
    /// Where `rebuild_world.sh` lives.
    pub scripts_dir: PathBuf,
    /// Holds `jail.conf.d/`.
    pub work_dir: PathBuf,
    /// How long installing a world waits for its jails to stop.
    pub world_stop_timeout: Duration,
    pub console: Arc<dyn ConsoleControl>,
    pub jail_conf: Arc<dyn JailConfWriter>,
}

impl Config {
    pub fn new(scripts_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Config {
            scripts_dir: scripts_dir.into(),
            work_dir: work_dir.into(),
            world_stop_timeout: Duration::from_secs(10),
            console: Arc::new(UnmanagedConsole),
            jail_conf: Arc::new(PrewrittenJailConf),
        }
    }
}

/// Every resource kind, ready for a [`felis_ledger::Ledger`].
pub fn registry(config: Config) -> Registry {
    let config = Arc::new(config);
    Registry::new()
        .register(zfs::Filesystem::new())
        .register(zfs::Snapshot::new())
        .register(zfs::CloneFs::new())
        .register(jail::World::new(config.clone()))
        .register(jail::Skel::new(config.clone()))
        .register(jail::Jail::new(config))
        .register(net::Interface::new())
        .register(net::IpAddress::new())
        .register(rctl::RctlRule::new())
}
