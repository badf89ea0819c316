//! RPC Server
//!
//! Binds the registry's services into one HTTP/2 endpoint. Handlers run on
//! a dedicated runtime sized by `rpc.server_threads`, separate from the
//! governed pools. Every accepted connection gets the configured HTTP/2
//! stream and connection windows.

use axum::extract::DefaultBodyLimit;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;

use super::registry::ServiceRegistry;
use crate::config::{Role, DEFAULT_MESSAGE_SIZE};
use crate::error::{ClusterError, Result, TransportError};

pub struct RpcServer {
    role: Role,
    bind_addr: SocketAddr,
    max_message_size: usize,
    flow_control_window: u32,
    runtime: Mutex<Option<Runtime>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
}

impl RpcServer {
    pub fn new(role: Role, bind_addr: SocketAddr, threads: usize, max_message_size: usize) -> Result<Self> {
        let counter = Arc::new(AtomicUsize::new(1));
        let prefix = format!("rpcserver-{}", role);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name_fn(move || format!("{}-{}", prefix, counter.fetch_add(1, Ordering::Relaxed)))
            .enable_all()
            .build()
            .map_err(|e| ClusterError::config(format!("cannot build rpc server runtime: {}", e)))?;

        Ok(Self {
            role,
            bind_addr,
            max_message_size,
            flow_control_window: DEFAULT_MESSAGE_SIZE as u32,
            runtime: Mutex::new(Some(runtime)),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Sets the HTTP/2 stream and connection window. HTTP/2 caps windows at
    /// `i32::MAX`.
    pub fn with_flow_control_window(mut self, window: u32) -> Self {
        self.flow_control_window = window.min(i32::MAX as u32);
        self
    }

    pub fn flow_control_window(&self) -> u32 {
        self.flow_control_window
    }

    /// Binds the socket and starts serving every service currently in
    /// `registry`. Returns the bound address.
    pub fn start(&self, registry: &ServiceRegistry) -> Result<SocketAddr> {
        let runtime = self.runtime.lock();
        let runtime = runtime
            .as_ref()
            .ok_or(TransportError::NoRuntime("rpc server already shut down"))?;

        let bind_error = |source| TransportError::Bind {
            addr: self.bind_addr.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(self.bind_addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(std_listener).map_err(bind_error)?
        };

        let app = registry
            .router()
            .layer(DefaultBodyLimit::max(self.max_message_size));
        let shutdown = self.shutdown.clone();
        let role = self.role;
        let window = self.flow_control_window;

        runtime.spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("{} rpc server accept failed: {}", role, e);
                            continue;
                        }
                    },
                    _ = shutdown.notified() => break,
                };

                let service = TowerToHyperService::new(app.clone());
                tokio::spawn(async move {
                    let mut builder = auto::Builder::new(TokioExecutor::new());
                    builder
                        .http2()
                        .initial_stream_window_size(window)
                        .initial_connection_window_size(window);
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                        tracing::debug!("{} rpc connection from {} closed: {}", role, peer, e);
                    }
                });
            }
            tracing::debug!("{} rpc server stopped accepting", role);
        });

        *self.local_addr.lock() = Some(local_addr);
        tracing::info!(
            "{} rpc server listening on {} with services {:?}",
            self.role,
            local_addr,
            registry.list_services()
        );
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Closes the socket and stops the server threads.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            tracing::info!("{} rpc server shut down", self.role);
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
