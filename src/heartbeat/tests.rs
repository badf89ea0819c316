//! Heartbeat Module Tests
//!
//! ## Test Scopes
//! - **Manager**: per-slave records, restart detection and listeners.
//! - **Resolver**: static master from configuration.
//! - **Service**: real reports over loopback, slow masters, master moves,
//!   and the wait for a restarted master.

#[cfg(test)]
mod tests {
    use crate::config::{HeartbeatConfig, Role};
    use crate::error::ClusterError;
    use crate::executor::{ExecutorType, PoolDescriptor, ResourceCaps, ResourceGovernor, TaskScheduler};
    use crate::heartbeat::types::{HEARTBEAT_METHOD, HEARTBEAT_SERVICE};
    use crate::heartbeat::{
        HeartbeatListener, HeartbeatManager, HeartbeatRecord, HeartbeatRequest, HeartbeatResponse,
        HeartbeatService, MasterResolver, StaticMasterResolver,
    };
    use crate::identity::NodeIdentity;
    use crate::lifecycle::{LifecycleHandle, NodeFlags, Sleeper};
    use crate::transport::{ChannelOptions, ClientFactory, Rpc, RpcServer, RpcService, ServiceRegistry};
    use axum::routing::post;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const SLAVE_PORT: u16 = 10061;

    #[derive(Default)]
    struct CountingListener {
        seen: AtomicUsize,
    }

    impl HeartbeatListener for CountingListener {
        fn on_heartbeat(&self, _record: &HeartbeatRecord) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Answers heartbeats only after `delay`.
    struct SlowMaster {
        delay: Duration,
    }

    impl RpcService for SlowMaster {
        fn service_name(&self) -> &'static str {
            HEARTBEAT_SERVICE
        }

        fn router(self: Arc<Self>) -> Router {
            let delay = self.delay;
            Router::new().route(
                &format!("/{}", HEARTBEAT_METHOD),
                post(move |Rpc(_request): Rpc<HeartbeatRequest>| async move {
                    tokio::time::sleep(delay).await;
                    Rpc(HeartbeatResponse::default())
                }),
            )
        }
    }

    struct Master {
        server: RpcServer,
        identity: NodeIdentity,
    }

    fn serve(service: Arc<dyn RpcService>) -> Master {
        let registry = ServiceRegistry::new();
        registry.register(service).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = RpcServer::new(Role::Master, addr, 2, 1 << 20).unwrap();
        let bound = server.start(&registry).unwrap();
        Master {
            server,
            identity: NodeIdentity::new("127.0.0.1", None, bound.port(), 0).unwrap(),
        }
    }

    fn start_master() -> (Master, Arc<HeartbeatManager>) {
        let manager = HeartbeatManager::new();
        (serve(manager.clone()), manager)
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 50,
            rpc_timeout_ms: 500,
            master_restart_timeout_ms: 5000,
            cluster_up_timeout_ms: 3000,
            cluster_up_poll_ms: 20,
            ..HeartbeatConfig::default()
        }
    }

    fn scheduler() -> TaskScheduler {
        let governor = ResourceGovernor::new(ResourceCaps::default());
        governor
            .register_pool(PoolDescriptor::new(ExecutorType::Default, 1, 2))
            .unwrap();
        governor.register_scheduled_pool(1, true).unwrap();
        TaskScheduler::new(Arc::new(governor))
    }

    struct Slave {
        service: Arc<HeartbeatService>,
        scheduler: TaskScheduler,
        flags: Arc<NodeFlags>,
    }

    impl Slave {
        fn new(config: HeartbeatConfig, resolver: Arc<dyn MasterResolver>) -> Self {
            let flags = Arc::new(NodeFlags::new());
            let lifecycle = LifecycleHandle::new(flags.clone(), Arc::new(Sleeper::new(Duration::from_secs(60))));
            let service = HeartbeatService::new(
                NodeIdentity::new("127.0.0.1", None, SLAVE_PORT, 1).unwrap(),
                config,
                resolver,
                Arc::new(ClientFactory::new(ChannelOptions::default(), 1, 1)),
                lifecycle,
            );
            Self {
                service,
                scheduler: scheduler(),
                flags,
            }
        }

        fn start(&self) {
            self.service.start(&self.scheduler).unwrap();
        }
    }

    impl Drop for Slave {
        fn drop(&mut self) {
            self.service.stop();
            self.scheduler.stop();
        }
    }

    async fn wait_until(what: impl Fn() -> bool) -> bool {
        for _ in 0..150 {
            if what() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        what()
    }

    fn request(port: u16, start_time: u64) -> HeartbeatRequest {
        HeartbeatRequest {
            sender: NodeIdentity::new("slave-1", None, port, start_time).unwrap(),
            report_time: start_time,
        }
    }

    // ============================================================
    // MANAGER
    // ============================================================

    #[test]
    fn test_manager_keeps_latest_per_slave() {
        // ARRANGE
        let manager = HeartbeatManager::new();
        let listener = Arc::new(CountingListener::default());
        manager.add_listener(listener.clone());

        // ACT: Two slaves, the first one restarts
        manager.accept(request(10060, 100));
        manager.accept(request(10061, 100));
        manager.accept(request(10060, 200));

        // ASSERT
        assert_eq!(manager.slave_count(), 2);
        assert_eq!(manager.received(), 3);
        assert_eq!(listener.seen.load(Ordering::SeqCst), 3);
        let latest = manager.latest("slave-1:10060").unwrap();
        assert_eq!(latest.sender.start_time(), 200);
    }

    #[test]
    fn test_live_slaves_filters_by_age() {
        let manager = HeartbeatManager::new();
        manager.accept(request(10060, 100));

        assert_eq!(manager.live_slaves(Duration::from_secs(60)).len(), 1);
        assert!(manager.latest("slave-1:9999").is_none());
    }

    // ============================================================
    // RESOLVER
    // ============================================================

    #[test]
    fn test_static_resolver_from_config() {
        let config = HeartbeatConfig {
            master_host: Some("master-1".to_string()),
            ..HeartbeatConfig::default()
        };

        let master = StaticMasterResolver::from_config(&config).resolve().unwrap();

        assert_eq!(master.host_and_port(), "master-1:10050");
        assert_eq!(master.start_time(), 0);
    }

    #[test]
    fn test_invalid_configured_master_is_absent() {
        let config = HeartbeatConfig {
            master_host: Some("-bad".to_string()),
            ..HeartbeatConfig::default()
        };

        assert!(StaticMasterResolver::from_config(&config).resolve().is_none());
    }

    // ============================================================
    // SERVICE
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_beats_reach_master() {
        // ARRANGE
        let (master, manager) = start_master();
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(fast_config(), resolver);

        // ACT
        slave.start();

        // ASSERT
        assert!(slave.service.wait_cluster_up().await);
        assert!(wait_until(|| manager.received() >= 3).await);
        assert!(manager.latest(&format!("127.0.0.1:{}", SLAVE_PORT)).is_some());
        assert_eq!(slave.service.current_master().await, Some(master.identity.clone()));
        master.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_master_at_startup() {
        let slave = Slave::new(fast_config(), Arc::new(StaticMasterResolver::default()));

        let result = slave.service.start(&slave.scheduler);

        assert!(matches!(result, Err(ClusterError::MasterUnavailable(_))));
        assert_eq!(slave.service.attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_start_is_rejected() {
        let (master, _manager) = start_master();
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(fast_config(), resolver);
        slave.start();

        assert!(slave.service.start(&slave.scheduler).is_err());
        master.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_master_does_not_stop_schedule() {
        // ARRANGE: Every answer arrives after the rpc timeout
        let master = serve(Arc::new(SlowMaster {
            delay: Duration::from_millis(400),
        }));
        let config = HeartbeatConfig {
            rpc_timeout_ms: 100,
            ..fast_config()
        };
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(config, resolver);

        // ACT
        slave.start();
        assert!(wait_until(|| slave.service.failures() >= 2).await);
        let before = slave.service.attempts();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // ASSERT: Beats keep coming, none acknowledged, no abort
        assert!(slave.service.attempts() > before);
        assert_eq!(slave.service.acknowledged(), 0);
        assert!(!slave.service.is_cluster_up());
        assert!(!slave.flags.is_aborted());
        master.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_follows_master_to_new_address() {
        // ARRANGE
        let (old_master, _old_manager) = start_master();
        let (new_master, new_manager) = start_master();
        let resolver = Arc::new(StaticMasterResolver::new(Some(old_master.identity.clone())));
        let slave = Slave::new(fast_config(), resolver.clone());
        slave.start();
        assert!(slave.service.wait_cluster_up().await);

        // ACT: The old master goes away and the resolver learns the new one
        old_master.server.shutdown();
        resolver.set(new_master.identity.clone());

        // ASSERT
        assert!(wait_until(|| new_manager.received() > 0).await);
        assert_eq!(slave.service.current_master().await, Some(new_master.identity.clone()));
        assert!(!slave.flags.is_aborted());
        new_master.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborts_when_master_never_returns() {
        // ARRANGE
        let (master, _manager) = start_master();
        let config = HeartbeatConfig {
            master_restart_timeout_ms: 300,
            ..fast_config()
        };
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(config, resolver.clone());
        slave.start();
        assert!(slave.service.wait_cluster_up().await);

        // ACT
        master.server.shutdown();
        resolver.clear();

        // ASSERT
        assert!(wait_until(|| slave.flags.is_aborted()).await);
        assert!(slave.flags.abort_reason().unwrap().contains("master"));
        assert!(!slave.service.is_cluster_up());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_master_restart_within_wait() {
        // ARRANGE
        let (master, _manager) = start_master();
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(fast_config(), resolver.clone());
        slave.start();
        assert!(slave.service.wait_cluster_up().await);

        // ACT: Master disappears, then a restarted one shows up
        master.server.shutdown();
        resolver.clear();
        assert!(wait_until(|| !slave.service.is_cluster_up()).await);

        let (restarted, restarted_manager) = start_master();
        resolver.set(restarted.identity.clone());

        // ASSERT
        assert!(wait_until(|| restarted_manager.received() > 0).await);
        assert!(slave.service.wait_cluster_up().await);
        assert!(!slave.flags.is_aborted());
        restarted.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_ends_beats() {
        let (master, manager) = start_master();
        let resolver = Arc::new(StaticMasterResolver::new(Some(master.identity.clone())));
        let slave = Slave::new(fast_config(), resolver);
        slave.start();
        assert!(slave.service.wait_cluster_up().await);

        slave.service.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = manager.received();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.received(), settled);
        master.server.shutdown();
    }
}
