//! Node Configuration
//!
//! Every tunable the node reads lives in one [`NodeConfig`] value. Each
//! section deserializes with `#[serde(default)]`, so a TOML file only needs
//! the keys it overrides:
//!
//! ```toml
//! host_name = "slave-3"
//!
//! [rpc]
//! port = 10060
//! max_message_size = 83886080
//!
//! [executor.pools.archive]
//! core_threads = 8
//! max_threads = 16
//! queue_size = 0   # rendezvous
//!
//! [heartbeat]
//! master_host = "master-1"
//! interval_ms = 3000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::executor::types::{
    ExecutorType, PoolDescriptor, QueueCapacity, RejectionPolicy, ResourceCaps,
};

pub const DEFAULT_MASTER_PORT: u16 = 10050;
pub const DEFAULT_SLAVE_PORT: u16 = 10060;
pub const DEFAULT_MESSAGE_SIZE: usize = 80 * 1024 * 1024;

fn cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Which side of the cluster a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            other => Err(ClusterError::config(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name other nodes reach this one by. Falls back to the local hostname.
    pub host_name: Option<String>,
    pub rpc: RpcConfig,
    pub executor: ExecutorConfig,
    pub heartbeat: HeartbeatConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_name: None,
            rpc: RpcConfig::default(),
            executor: ExecutorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Listening port. `None` picks the role default.
    pub port: Option<u16>,
    pub bind_address: String,
    pub max_message_size: usize,
    pub flow_control_window: u32,
    /// Business threads behind the listening endpoint.
    pub server_threads: usize,
    pub channels_per_client: usize,
    pub clients_per_host: usize,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind_address: "0.0.0.0".to_string(),
            max_message_size: DEFAULT_MESSAGE_SIZE,
            flow_control_window: DEFAULT_MESSAGE_SIZE as u32,
            server_threads: 2 * cpus(),
            channels_per_client: 4,
            clients_per_host: 10,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub caps: ResourceCaps,
    pub scheduled: ScheduledPoolConfig,
    /// Normal pools keyed by executor type name. Entries from a file are
    /// layered over the built-in default/archive/compact pools.
    #[serde(deserialize_with = "merge_with_default_pools")]
    pub pools: BTreeMap<String, PoolConfig>,
}

fn default_pools() -> BTreeMap<String, PoolConfig> {
    [ExecutorType::Default, ExecutorType::Archive, ExecutorType::Compact]
        .into_iter()
        .map(|t| (t.as_str().to_string(), PoolConfig::default()))
        .collect()
}

fn merge_with_default_pools<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, PoolConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = BTreeMap::<String, PoolConfig>::deserialize(deserializer)?;
    let mut pools = default_pools();
    pools.extend(overrides);
    Ok(pools)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            caps: ResourceCaps::default(),
            scheduled: ScheduledPoolConfig::default(),
            pools: default_pools(),
        }
    }
}

impl ExecutorConfig {
    /// Turns the pool table into descriptors. `Scheduled` is not a normal
    /// pool and unknown names are configuration errors.
    pub fn descriptors(&self) -> Result<Vec<PoolDescriptor>> {
        self.pools
            .iter()
            .map(|(name, pool)| {
                let executor_type: ExecutorType = name.parse()?;
                if executor_type == ExecutorType::Scheduled {
                    return Err(ClusterError::config(
                        "the scheduled pool is configured under [executor.scheduled]",
                    ));
                }
                Ok(pool.descriptor(executor_type))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledPoolConfig {
    pub core_threads: usize,
    pub daemon: bool,
}

impl Default for ScheduledPoolConfig {
    fn default() -> Self {
        Self {
            core_threads: cpus(),
            daemon: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub core_threads: usize,
    pub max_threads: usize,
    /// `<= 0` selects a rendezvous queue.
    pub queue_size: i64,
    pub keep_alive_ms: u64,
    pub daemon: bool,
    pub rejection: RejectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 100,
            max_threads: 100,
            queue_size: 100,
            keep_alive_ms: 1000,
            daemon: true,
            rejection: RejectionPolicy::Abort,
        }
    }
}

impl PoolConfig {
    pub fn descriptor(&self, executor_type: ExecutorType) -> PoolDescriptor {
        PoolDescriptor::new(executor_type, self.core_threads, self.max_threads)
            .with_queue(QueueCapacity::from_config(self.queue_size))
            .with_keep_alive(Duration::from_millis(self.keep_alive_ms))
            .with_daemon(self.daemon)
            .with_rejection(self.rejection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub master_restart_timeout_ms: u64,
    pub cluster_up_timeout_ms: u64,
    pub cluster_up_poll_ms: u64,
    /// Static master location used by the default resolver.
    pub master_host: Option<String>,
    pub master_port: u16,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            rpc_timeout_ms: 3000,
            master_restart_timeout_ms: 600_000,
            cluster_up_timeout_ms: 30_000,
            cluster_up_poll_ms: 1000,
            master_host: None,
            master_port: DEFAULT_MASTER_PORT,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn master_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.master_restart_timeout_ms)
    }

    /// Re-checks allowed while waiting for a restarted master.
    pub fn max_restart_checks(&self) -> u64 {
        self.master_restart_timeout_ms / self.interval_ms.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub sleep_period_ms: u64,
    pub exit_wait_timeout_ms: u64,
    pub exit_poll_interval_ms: u64,
    /// Refuse to start a master whose `host_name` is not this machine.
    pub verify_local_hostname: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sleep_period_ms: 60_000,
            exit_wait_timeout_ms: 60_000,
            exit_poll_interval_ms: 3000,
            verify_local_hostname: false,
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(raw)
            .map_err(|e| ClusterError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        tracing::info!("Loading node configuration from {}", path.display());
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc.max_message_size == 0 {
            return Err(ClusterError::config("rpc.max_message_size must be positive"));
        }
        if self.rpc.server_threads == 0 {
            return Err(ClusterError::config("rpc.server_threads must be positive"));
        }
        if self.rpc.channels_per_client == 0 || self.rpc.clients_per_host == 0 {
            return Err(ClusterError::config(
                "rpc.channels_per_client and rpc.clients_per_host must be positive",
            ));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.rpc_timeout_ms == 0 {
            return Err(ClusterError::config(
                "heartbeat.interval_ms and heartbeat.rpc_timeout_ms must be positive",
            ));
        }
        if self.lifecycle.exit_poll_interval_ms == 0 {
            return Err(ClusterError::config(
                "lifecycle.exit_poll_interval_ms must be positive",
            ));
        }
        if !self.executor.pools.contains_key(ExecutorType::Default.as_str()) {
            return Err(ClusterError::config("executor.pools.default is required"));
        }
        for descriptor in self.executor.descriptors()? {
            if descriptor.max_threads == 0 || descriptor.max_threads < descriptor.core_threads {
                return Err(ClusterError::config(format!(
                    "pool {} needs 0 < core_threads <= max_threads, got {}/{}",
                    descriptor.executor_type, descriptor.core_threads, descriptor.max_threads
                )));
            }
        }
        Ok(())
    }

    pub fn rpc_port(&self, role: Role) -> u16 {
        self.rpc.port.unwrap_or(match role {
            Role::Master => DEFAULT_MASTER_PORT,
            Role::Slave => DEFAULT_SLAVE_PORT,
        })
    }

    pub fn sleep_period(&self) -> Duration {
        Duration::from_millis(self.lifecycle.sleep_period_ms)
    }
}
