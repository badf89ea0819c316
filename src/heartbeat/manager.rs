//! Master Heartbeat Manager
//!
//! Serves the heartbeat RPC. Keeps the latest report of every slave, keyed
//! by `host:port`, and hands each report to the registered listeners.

use axum::routing::post;
use axum::{Extension, Router};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    HeartbeatListener, HeartbeatRecord, HeartbeatRequest, HeartbeatResponse, HEARTBEAT_METHOD,
    HEARTBEAT_SERVICE,
};
use crate::error::Result;
use crate::identity::{now_ms, NodeIdentity};
use crate::lifecycle::node::{NodeContext, SubService};
use crate::transport::{Rpc, RpcService, ServiceRegistry};

#[derive(Default)]
pub struct HeartbeatManager {
    slaves: DashMap<String, HeartbeatRecord>,
    listeners: RwLock<Vec<Arc<dyn HeartbeatListener>>>,
    received: AtomicU64,
}

impl HeartbeatManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_listener(&self, listener: Arc<dyn HeartbeatListener>) {
        self.listeners.write().push(listener);
    }

    /// Records one report and notifies the listeners.
    pub fn accept(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        let record = HeartbeatRecord {
            sender: request.sender,
            report_time: request.report_time,
            received_at: now_ms(),
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        let key = record.sender.host_and_port();
        match self.slaves.insert(key, record.clone()) {
            None => tracing::info!("First heartbeat from slave {}", record.sender),
            Some(previous) if previous.sender.is_restart_of(&record.sender) => {
                tracing::info!("Slave {} restarted (was {})", record.sender, previous.sender)
            }
            Some(_) => tracing::debug!("Heartbeat from {}", record.sender),
        }

        for listener in self.listeners.read().iter() {
            listener.on_heartbeat(&record);
        }

        HeartbeatResponse::default()
    }

    pub fn latest(&self, host_and_port: &str) -> Option<HeartbeatRecord> {
        self.slaves.get(host_and_port).map(|entry| entry.value().clone())
    }

    /// Slaves whose last report arrived within `max_age`.
    pub fn live_slaves(&self, max_age: Duration) -> Vec<NodeIdentity> {
        let now = now_ms();
        let max_age = max_age.as_millis() as u64;
        self.slaves
            .iter()
            .filter(|entry| now.saturating_sub(entry.received_at) <= max_age)
            .map(|entry| entry.sender.clone())
            .collect()
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

async fn handle_report(
    Extension(manager): Extension<Arc<HeartbeatManager>>,
    Rpc(request): Rpc<HeartbeatRequest>,
) -> Rpc<HeartbeatResponse> {
    Rpc(manager.accept(request))
}

impl RpcService for HeartbeatManager {
    fn service_name(&self) -> &'static str {
        HEARTBEAT_SERVICE
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&format!("/{}", HEARTBEAT_METHOD), post(handle_report))
            .layer(Extension(self))
    }
}

impl SubService for HeartbeatManager {
    fn name(&self) -> &'static str {
        "heartbeat-manager"
    }

    fn register_rpc(self: Arc<Self>, registry: &ServiceRegistry) -> Result<()> {
        registry.register(self)
    }

    fn init(self: Arc<Self>, _ctx: &NodeContext) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {
        tracing::info!("Heartbeat manager stopped, {} slaves known", self.slave_count());
    }
}
