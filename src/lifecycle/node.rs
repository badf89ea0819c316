//! Node Orchestration
//!
//! A [`Node`] owns one [`NodeContext`] and drives its sub-services through
//! startup, the idle loop and teardown:
//!
//! 1. register every sub-service's RPC handlers,
//! 2. bind the RPC endpoint (`receptor_started`),
//! 3. initialize the sub-services in order,
//! 4. set `initialized` and idle until `stopped`,
//! 5. tear down in reverse: sub-services, endpoint, clients, pools.
//!
//! Any startup error aborts the node and runs the same teardown. A panic
//! in startup or in the idle loop is caught once and takes the same path.

use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::flags::NodeFlags;
use super::monitor::TaskMonitor;
use super::sleeper::Sleeper;
use crate::config::{NodeConfig, Role};
use crate::error::{ClusterError, Result};
use crate::executor::pool::panic_message;
use crate::executor::{ResourceGovernor, TaskScheduler};
use crate::heartbeat::{HeartbeatManager, HeartbeatService, MasterResolver, StaticMasterResolver};
use crate::identity::{local_hostname, NodeIdentity};
use crate::transport::{ClientFactory, RpcServer, ServiceRegistry};

/// A pluggable node component driven by the lifecycle.
pub trait SubService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adds this component's RPC handlers. Runs before the endpoint binds.
    fn register_rpc(self: Arc<Self>, registry: &ServiceRegistry) -> Result<()> {
        let _ = registry;
        Ok(())
    }

    /// Runs after the endpoint is serving.
    fn init(self: Arc<Self>, ctx: &NodeContext) -> Result<()>;

    fn stop(&self);
}

/// Lets components stop or abort the node that owns them.
#[derive(Clone, Debug)]
pub struct LifecycleHandle {
    flags: Arc<NodeFlags>,
    sleeper: Arc<Sleeper>,
}

impl LifecycleHandle {
    pub fn new(flags: Arc<NodeFlags>, sleeper: Arc<Sleeper>) -> Self {
        Self { flags, sleeper }
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.is_stopped()
    }

    pub fn flags(&self) -> &Arc<NodeFlags> {
        &self.flags
    }

    /// Clean stop: set `stopped` and wake the idle loop.
    pub fn request_stop(&self, why: &str) {
        if !self.flags.is_stopped() {
            tracing::info!("Stop requested: {}", why);
        }
        self.flags.set_stopped(true);
        self.sleeper.skip_sleep_cycle();
    }

    /// Terminal stop after a fault.
    pub fn abort(&self, why: &str) {
        if self.flags.abort(why) {
            tracing::error!("Aborting node: {}", why);
        }
        self.sleeper.skip_sleep_cycle();
    }
}

/// Everything a node's components share, built once at startup.
pub struct NodeContext {
    pub role: Role,
    pub config: NodeConfig,
    pub identity: NodeIdentity,
    pub governor: Arc<ResourceGovernor>,
    pub scheduler: TaskScheduler,
    pub registry: Arc<ServiceRegistry>,
    pub clients: Arc<ClientFactory>,
    pub monitor: TaskMonitor,
    pub flags: Arc<NodeFlags>,
    pub sleeper: Arc<Sleeper>,
}

impl NodeContext {
    pub fn lifecycle(&self) -> LifecycleHandle {
        LifecycleHandle::new(self.flags.clone(), self.sleeper.clone())
    }
}

pub struct Node {
    ctx: Arc<NodeContext>,
    server: RpcServer,
    sub_services: Vec<Arc<dyn SubService>>,
    heartbeat: Option<Arc<HeartbeatService>>,
    manager: Option<Arc<HeartbeatManager>>,
    torn_down: AtomicBool,
}

impl Node {
    /// Builds a node whose slave heartbeat finds the master through the
    /// `heartbeat.master_host` setting.
    pub fn new(role: Role, config: NodeConfig) -> Result<Self> {
        let resolver = Arc::new(StaticMasterResolver::from_config(&config.heartbeat));
        Self::with_resolver(role, config, resolver)
    }

    pub fn with_resolver(role: Role, config: NodeConfig, resolver: Arc<dyn MasterResolver>) -> Result<Self> {
        config.validate()?;
        let identity = build_identity(role, &config)?;
        tracing::info!("## Building {} node {}", role, identity);

        let governor = ResourceGovernor::from_config(&config.executor)?;
        let scheduler = TaskScheduler::new(governor.clone());
        let clients = Arc::new(ClientFactory::from_config(&config.rpc));

        let bind_addr: SocketAddr = format!("{}:{}", config.rpc.bind_address, config.rpc_port(role))
            .parse()
            .map_err(|e| ClusterError::config(format!("bad rpc bind address: {}", e)))?;
        let server = RpcServer::new(role, bind_addr, config.rpc.server_threads, config.rpc.max_message_size)?
            .with_flow_control_window(config.rpc.flow_control_window);

        let sleeper = Arc::new(Sleeper::new(config.sleep_period()));
        let ctx = Arc::new(NodeContext {
            role,
            identity,
            governor,
            scheduler,
            registry: ServiceRegistry::new(),
            clients,
            monitor: TaskMonitor::new(),
            flags: Arc::new(NodeFlags::new()),
            sleeper,
            config,
        });

        let mut node = Self {
            server,
            sub_services: Vec::new(),
            heartbeat: None,
            manager: None,
            torn_down: AtomicBool::new(false),
            ctx,
        };

        match role {
            Role::Master => {
                let manager = HeartbeatManager::new();
                node.sub_services.push(manager.clone());
                node.manager = Some(manager);
            }
            Role::Slave => {
                let heartbeat = HeartbeatService::from_context(&node.ctx, resolver);
                node.sub_services.push(heartbeat.clone());
                node.heartbeat = Some(heartbeat);
            }
        }

        Ok(node)
    }

    /// Adds a component. Components start in the order they were added,
    /// after the built-in heartbeat component, and stop in reverse.
    pub fn add_sub_service(&mut self, service: Arc<dyn SubService>) {
        self.sub_services.push(service);
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn role(&self) -> Role {
        self.ctx.role
    }

    pub fn flags(&self) -> &Arc<NodeFlags> {
        &self.ctx.flags
    }

    pub fn lifecycle(&self) -> LifecycleHandle {
        self.ctx.lifecycle()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn heartbeat(&self) -> Option<&Arc<HeartbeatService>> {
        self.heartbeat.as_ref()
    }

    pub fn heartbeat_manager(&self) -> Option<&Arc<HeartbeatManager>> {
        self.manager.as_ref()
    }

    /// Runs the startup sequence. Returns once the node is initialized.
    pub async fn start(&self) -> Result<()> {
        let ctx = &self.ctx;
        let status = ctx
            .monitor
            .create_status(format!("Starting {} node {}", ctx.role, ctx.identity));
        if ctx.role == Role::Master {
            ctx.flags.set_active(true);
        }

        status.set_status("registering rpc services");
        for service in &self.sub_services {
            service.clone().register_rpc(&ctx.registry)?;
        }

        status.set_status("starting rpc endpoint");
        self.server.start(&ctx.registry)?;
        ctx.flags.set_receptor_started(true);

        for service in &self.sub_services {
            status.set_status(&format!("initializing {}", service.name()));
            service.clone().init(ctx)?;
        }

        if let Some(heartbeat) = &self.heartbeat {
            status.pause("waiting for the master to acknowledge");
            if heartbeat.wait_cluster_up().await {
                status.resume("cluster is up");
            } else {
                status.resume("master has not acknowledged yet, continuing");
                tracing::warn!("Master has not acknowledged a heartbeat yet");
            }
        }

        ctx.flags.set_initialized(true);
        if ctx.role == Role::Master {
            ctx.flags.set_premiered(true);
        }
        status.mark_complete(&format!("{} node {} is up", ctx.role, ctx.identity));
        Ok(())
    }

    /// Starts the node, idles until stopped, then tears down. A clean stop
    /// returns `Ok`; an abort, at startup or later, returns the reason.
    pub async fn run(&self) -> Result<()> {
        let started = AssertUnwindSafe(self.start()).catch_unwind().await;
        let failure = match started {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some((format!("startup failed: {}", e), e)),
            Err(panic) => {
                let reason = format!("startup panicked: {}", panic_message(panic.as_ref()));
                let e = ClusterError::Fault(anyhow::anyhow!("{}", reason));
                Some((reason, e))
            }
        };
        if let Some((reason, e)) = failure {
            self.lifecycle().abort(&reason);
            self.shutdown().await;
            return Err(e);
        }

        let idle = AssertUnwindSafe(self.idle()).catch_unwind().await;
        if let Err(panic) = idle {
            let reason = format!("idle loop panicked: {}", panic_message(panic.as_ref()));
            self.lifecycle().abort(&reason);
        }

        self.shutdown().await;

        match self.ctx.flags.abort_reason() {
            Some(reason) if self.ctx.flags.is_aborted() => Err(ClusterError::Fault(anyhow::anyhow!(
                "node aborted: {}",
                reason
            ))),
            _ => Ok(()),
        }
    }

    async fn idle(&self) {
        while !self.ctx.flags.is_stopped() {
            self.ctx.sleeper.sleep().await;
        }
    }

    /// Ordered teardown. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let ctx = &self.ctx;
        ctx.flags.set_stopped(true);
        ctx.sleeper.skip_sleep_cycle();

        let status = ctx.monitor.create_status(format!("Closing {} node {}", ctx.role, ctx.identity));
        for service in self.sub_services.iter().rev() {
            status.set_status(&format!("stopping {}", service.name()));
            service.stop();
        }

        status.set_status("stopping rpc endpoint");
        self.server.shutdown();
        ctx.clients.close();

        status.set_status("stopping executors");
        ctx.scheduler.stop();

        if ctx.role == Role::Slave {
            ctx.flags.set_exit_safe(true);
        }
        if ctx.flags.is_aborted() {
            status.abort("node aborted");
        } else {
            status.mark_complete("node closed");
        }
        tracing::info!("## Node flags at exit: {:?}", ctx.flags.snapshot());
    }

    /// Waits for the slave teardown to finish, up to the configured exit
    /// timeout. Logs an error and returns false if it never does.
    pub async fn wait_for_exit_safe(&self) -> bool {
        let lifecycle = &self.ctx.config.lifecycle;
        let poll = Duration::from_millis(lifecycle.exit_poll_interval_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(lifecycle.exit_wait_timeout_ms);

        loop {
            if self.ctx.flags.is_exit_safe() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::error!(
                    "Slave did not finish teardown within {} ms, unflushed data may be lost",
                    lifecycle.exit_wait_timeout_ms
                );
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

fn build_identity(role: Role, config: &NodeConfig) -> Result<NodeIdentity> {
    let local = local_hostname();
    let host = config
        .host_name
        .clone()
        .or_else(|| local.clone())
        .unwrap_or_else(|| "localhost".to_string());

    if role == Role::Master && config.lifecycle.verify_local_hostname && local.as_deref() != Some(host.as_str()) {
        return Err(ClusterError::config(format!(
            "master host {} is not this machine ({})",
            host,
            local.as_deref().unwrap_or("unknown")
        )));
    }

    NodeIdentity::starting_now(host, config.rpc_port(role))
}
