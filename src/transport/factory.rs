//! Client Factory
//!
//! Caches, per `(host, port)`, a set of M channel pools built on first use
//! and handed out round-robin. Stubs are built over a channel taken from the
//! next pool in the set.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::channel::ChannelOptions;
use super::pool::ChannelPool;
use super::stub::{RpcStub, ServiceStub, StubFlavor};
use crate::config::RpcConfig;
use crate::error::TransportError;

struct ClientSet {
    pools: Vec<Arc<ChannelPool>>,
    cursor: AtomicUsize,
}

impl ClientSet {
    fn next(&self) -> Arc<ChannelPool> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        self.pools[index].clone()
    }
}

pub struct ClientFactory {
    options: ChannelOptions,
    channels_per_client: usize,
    clients_per_host: usize,
    clients: DashMap<(String, u16), Arc<ClientSet>>,
    closed: AtomicBool,
}

impl ClientFactory {
    pub fn new(options: ChannelOptions, channels_per_client: usize, clients_per_host: usize) -> Self {
        Self {
            options,
            channels_per_client: channels_per_client.max(1),
            clients_per_host: clients_per_host.max(1),
            clients: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(
            ChannelOptions::from(config),
            config.channels_per_client,
            config.clients_per_host,
        )
    }

    /// Next pool for `host:port`, building the set on first use.
    pub fn get_client(&self, host: &str, port: u16) -> Result<Arc<ChannelPool>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelShutdown(format!("{}:{}", host, port)));
        }

        let key = (host.to_string(), port);
        if let Some(set) = self.clients.get(&key) {
            return Ok(set.next());
        }

        let set = self
            .clients
            .entry(key)
            .or_try_insert_with(|| {
                tracing::info!(
                    "Creating {} clients x {} channels for {}:{}",
                    self.clients_per_host,
                    self.channels_per_client,
                    host,
                    port
                );
                let pools = (0..self.clients_per_host)
                    .map(|_| {
                        ChannelPool::new(host, port, self.channels_per_client, self.options.clone())
                            .map(Arc::new)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, TransportError>(Arc::new(ClientSet {
                    pools,
                    cursor: AtomicUsize::new(0),
                }))
            })?
            .clone();

        Ok(set.next())
    }

    /// Untyped stub for a service named at runtime.
    pub fn get_stub_by_name(
        &self,
        service: &str,
        host: &str,
        port: u16,
        flavor: StubFlavor,
    ) -> Result<ServiceStub, TransportError> {
        let channel = self.get_client(host, port)?.get_channel()?;
        ServiceStub::new(service, flavor, channel)
    }

    pub fn get_stub<S: RpcStub>(&self, host: &str, port: u16, flavor: StubFlavor) -> Result<S, TransportError> {
        self.get_stub_by_name(S::SERVICE_NAME, host, port, flavor)
            .map(S::from_stub)
    }

    pub fn cached_hosts(&self) -> usize {
        self.clients.len()
    }

    /// Shuts every cached channel. The factory builds nothing afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.clients.iter() {
            for pool in &entry.value().pools {
                pool.shutdown();
            }
        }
        self.clients.clear();
        tracing::info!("Client factory closed");
    }
}
