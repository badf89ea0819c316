//! Slave Heartbeat Service
//!
//! Reports to the master on a fixed-delay schedule. A report that fails or
//! outlives `rpc_timeout` sends the service back to the resolver:
//! - a master at a new address or with a new start time gets a fresh stub;
//! - no master at all marks the cluster down and waits, probing once per
//!   interval, for up to `master_restart_timeout`, then aborts the slave.
//!
//! The schedule is never ended by a failed beat.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::resolver::MasterResolver;
use super::types::{HeartbeatRequest, HeartbeatResponse, HeartbeatStub};
use crate::config::HeartbeatConfig;
use crate::error::{ClusterError, Result};
use crate::executor::{CyclicTaskEnvelope, CyclicTaskHandle, TaskScheduler};
use crate::identity::{now_ms, NodeIdentity};
use crate::lifecycle::node::{LifecycleHandle, NodeContext, SubService};
use crate::transport::{ClientFactory, StubFlavor};

struct MasterLink {
    master: NodeIdentity,
    stub: HeartbeatStub,
}

pub struct HeartbeatService {
    identity: NodeIdentity,
    config: HeartbeatConfig,
    resolver: Arc<dyn MasterResolver>,
    clients: Arc<ClientFactory>,
    lifecycle: LifecycleHandle,
    link: Mutex<Option<MasterLink>>,
    schedule: parking_lot::Mutex<Option<CyclicTaskHandle>>,
    cluster_up: AtomicBool,
    attempts: AtomicU64,
    acknowledged: AtomicU64,
    failures: AtomicU64,
}

impl HeartbeatService {
    pub fn new(
        identity: NodeIdentity,
        config: HeartbeatConfig,
        resolver: Arc<dyn MasterResolver>,
        clients: Arc<ClientFactory>,
        lifecycle: LifecycleHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            config,
            resolver,
            clients,
            lifecycle,
            link: Mutex::new(None),
            schedule: parking_lot::Mutex::new(None),
            cluster_up: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn from_context(ctx: &NodeContext, resolver: Arc<dyn MasterResolver>) -> Arc<Self> {
        Self::new(
            ctx.identity.clone(),
            ctx.config.heartbeat.clone(),
            resolver,
            ctx.clients.clone(),
            ctx.lifecycle(),
        )
    }

    /// Resolves the master and schedules the beat. Fails when no master
    /// address is available.
    pub fn start(self: &Arc<Self>, scheduler: &TaskScheduler) -> Result<()> {
        let master = self.resolver.resolve().ok_or_else(|| {
            ClusterError::MasterUnavailable("resolver returned no master at startup".to_string())
        })?;
        let stub = self.build_stub(&master)?;
        tracing::info!("Heartbeat target is master {} ({})", master, stub.target());

        {
            let mut link = self
                .link
                .try_lock()
                .map_err(|_| ClusterError::config("heartbeat service already started"))?;
            if link.is_some() {
                return Err(ClusterError::config("heartbeat service already started"));
            }
            *link = Some(MasterLink { master, stub });
        }

        let service = Arc::downgrade(self);
        let envelope = CyclicTaskEnvelope::fixed_delay("heartbeat", self.config.interval(), move || {
            let service = service.clone();
            async move {
                if let Some(service) = service.upgrade() {
                    service.beat().await;
                }
                Ok(())
            }
        });

        let handle = scheduler.submit_cyclic(envelope)?;
        *self.schedule.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.schedule.lock().take() {
            handle.cancel();
            tracing::info!("Heartbeat stopped after {} beats", handle.executions());
        }
    }

    pub fn is_cluster_up(&self) -> bool {
        self.cluster_up.load(Ordering::Acquire)
    }

    /// Beats started, whatever their outcome.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn current_master(&self) -> Option<NodeIdentity> {
        self.link.lock().await.as_ref().map(|link| link.master.clone())
    }

    /// Polls until a beat has been acknowledged or the cluster-up timeout
    /// passes. Returns whether the cluster came up.
    pub async fn wait_cluster_up(&self) -> bool {
        let step = Duration::from_millis(self.config.cluster_up_poll_ms.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.cluster_up_timeout_ms);

        while !self.is_cluster_up() {
            if self.lifecycle.is_stopped() || tokio::time::Instant::now() >= deadline {
                return self.is_cluster_up();
            }
            tokio::time::sleep(step).await;
        }
        true
    }

    fn build_stub(&self, master: &NodeIdentity) -> Result<HeartbeatStub> {
        Ok(self
            .clients
            .get_stub::<HeartbeatStub>(master.host(), master.port(), StubFlavor::Future)?)
    }

    /// One heartbeat round, including any recovery it triggers. Never fails.
    async fn beat(&self) {
        if self.lifecycle.is_stopped() {
            return;
        }
        let mut link = self.link.lock().await;
        let Some(current) = link.as_ref() else {
            return;
        };

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let request = HeartbeatRequest {
            sender: self.identity.clone(),
            report_time: now_ms(),
        };

        let outcome = self.report(&current.stub, &request).await;
        match outcome {
            Ok(_) => {
                self.acknowledged.fetch_add(1, Ordering::Relaxed);
                if !self.cluster_up.swap(true, Ordering::AcqRel) {
                    tracing::info!("Master {} acknowledged heartbeat, cluster is up", current.master);
                } else {
                    tracing::debug!("Heartbeat acknowledged by {}", current.master);
                }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Heartbeat to master {} failed: {}", current.master, e);
                self.recover(&mut link).await;
            }
        }
    }

    async fn report(&self, stub: &HeartbeatStub, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mut pending = stub.report(request)?;
        let timeout = self.config.rpc_timeout();

        match tokio::time::timeout(timeout, &mut pending).await {
            Ok(reply) => Ok(reply?),
            Err(_) => {
                pending.cancel();
                Err(ClusterError::RpcTimeout(timeout))
            }
        }
    }

    async fn recover(&self, link: &mut Option<MasterLink>) {
        match self.resolver.resolve() {
            Some(master) => self.relink(link, master),
            None => {
                self.cluster_up.store(false, Ordering::Release);
                tracing::warn!(
                    "No master address available, waiting up to {:?} for a restart",
                    self.config.master_restart_timeout()
                );
                self.wait_for_master_restart(link).await;
            }
        }
    }

    /// Points the link at `master`, rebuilding the stub if the master moved
    /// or restarted.
    fn relink(&self, link: &mut Option<MasterLink>, master: NodeIdentity) {
        let unchanged = link.as_ref().map(|l| l.master == master).unwrap_or(false);
        if unchanged {
            tracing::debug!("Master {} unchanged, retrying on the next beat", master);
            return;
        }

        match self.build_stub(&master) {
            Ok(stub) => {
                tracing::info!("Master is now {}, rebuilt heartbeat stub", master);
                *link = Some(MasterLink { master, stub });
            }
            Err(e) => tracing::error!("Cannot build heartbeat stub for {}: {}", master, e),
        }
    }

    async fn wait_for_master_restart(&self, link: &mut Option<MasterLink>) {
        let max_checks = self.config.max_restart_checks();
        let interval = self.config.interval();

        for check in 1..=max_checks {
            if self.lifecycle.is_stopped() {
                return;
            }
            tokio::time::sleep(interval).await;

            if let Some(master) = self.resolver.resolve() {
                tracing::info!("Master {} is back after {} checks", master, check);
                self.relink(link, master);
                return;
            }
            if check % 10 == 0 {
                tracing::info!("Still waiting for the master, check {} of {}", check, max_checks);
            }
        }

        tracing::error!(
            "No master within {:?}, aborting",
            self.config.master_restart_timeout()
        );
        self.lifecycle.abort("master did not come back before the restart timeout");
    }
}

impl SubService for HeartbeatService {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn init(self: Arc<Self>, ctx: &NodeContext) -> Result<()> {
        self.start(&ctx.scheduler)
    }

    fn stop(&self) {
        HeartbeatService::stop(self);
    }
}
