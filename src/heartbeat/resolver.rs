//! Master address lookup.

use parking_lot::RwLock;

use crate::config::HeartbeatConfig;
use crate::identity::NodeIdentity;

/// Where the master currently lives. `None` means no master is known.
pub trait MasterResolver: Send + Sync {
    fn resolve(&self) -> Option<NodeIdentity>;
}

/// Resolver over an address held in memory, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticMasterResolver {
    master: RwLock<Option<NodeIdentity>>,
}

impl StaticMasterResolver {
    pub fn new(master: Option<NodeIdentity>) -> Self {
        Self {
            master: RwLock::new(master),
        }
    }

    /// Master from `heartbeat.master_host`/`master_port`, with an unknown
    /// start time. An invalid host is logged and treated as absent.
    pub fn from_config(config: &HeartbeatConfig) -> Self {
        let master = config.master_host.as_ref().and_then(|host| {
            NodeIdentity::new(host.clone(), None, config.master_port, 0)
                .map_err(|e| tracing::error!("Ignoring configured master: {}", e))
                .ok()
        });
        Self::new(master)
    }

    pub fn set(&self, master: NodeIdentity) {
        *self.master.write() = Some(master);
    }

    pub fn clear(&self) {
        *self.master.write() = None;
    }
}

impl MasterResolver for StaticMasterResolver {
    fn resolve(&self) -> Option<NodeIdentity> {
        self.master.read().clone()
    }
}
