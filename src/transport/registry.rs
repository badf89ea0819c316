//! RPC Service Registry
//!
//! Server-side table of named services. Every service registered before the
//! server starts is mounted under `/rpc/<name>` on the one listening
//! endpoint. Names are unique and a registration is permanent.

use axum::Router;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::protocol;
use crate::error::{ClusterError, Result};

/// A server-side service. Its router holds method routes relative to the
/// service mount point, e.g. `/report`.
pub trait RpcService: Send + Sync + 'static {
    fn service_name(&self) -> &'static str;

    fn router(self: Arc<Self>) -> Router;
}

pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn RpcService>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `service` under its name. Fails if the name is taken.
    pub fn register(&self, service: Arc<dyn RpcService>) -> Result<()> {
        let name = service.service_name();
        match self.services.entry(name.to_string()) {
            Entry::Occupied(_) => {
                tracing::error!("RPC service {} is already registered", name);
                Err(ClusterError::DuplicateRegistration {
                    kind: "rpc service",
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(service);
                tracing::info!("Registered RPC service: {}", name);
                Ok(())
            }
        }
    }

    /// One router with every registered service mounted.
    pub fn router(&self) -> Router {
        self.services.iter().fold(Router::new(), |router, entry| {
            router.nest(&protocol::service_path(entry.key()), entry.value().clone().router())
        })
    }

    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            services: DashMap::new(),
        }
    }
}
