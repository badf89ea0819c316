//! Channel Pool
//!
//! N channels to one `host:port`, handed out round-robin. A slot whose
//! channel has been shut down is rebuilt on the next visit, under the pool's
//! rebuild lock and only after re-checking the slot, so racing callers build
//! at most one replacement.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::channel::{Channel, ChannelOptions};
use crate::error::TransportError;

pub struct ChannelPool {
    host: String,
    port: u16,
    options: ChannelOptions,
    slots: Vec<RwLock<Arc<Channel>>>,
    rebuild: Mutex<()>,
    cursor: AtomicUsize,
    rebuilt: AtomicUsize,
    closed: AtomicBool,
}

impl ChannelPool {
    /// Builds all `size` channels up front.
    pub fn new(host: &str, port: u16, size: usize, options: ChannelOptions) -> Result<Self, TransportError> {
        let slots = (0..size.max(1))
            .map(|_| Channel::connect(host, port, &options).map(|c| RwLock::new(Arc::new(c))))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Built {} channels to {}:{}", slots.len(), host, port);

        Ok(Self {
            host: host.to_string(),
            port,
            options,
            slots,
            rebuild: Mutex::new(()),
            cursor: AtomicUsize::new(0),
            rebuilt: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Channels rebuilt since the pool was created.
    pub fn rebuilt_count(&self) -> usize {
        self.rebuilt.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Next channel in round-robin order. Never returns a shut down channel.
    pub fn get_channel(&self) -> Result<Arc<Channel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ChannelShutdown(format!("{}:{}", self.host, self.port)));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = &self.slots[index];

        let current = slot.read().clone();
        if current.is_usable() {
            return Ok(current);
        }

        let _rebuilding = self.rebuild.lock();
        let current = slot.read().clone();
        if current.is_usable() {
            return Ok(current);
        }
        if self.is_closed() {
            return Err(TransportError::ChannelShutdown(format!("{}:{}", self.host, self.port)));
        }

        tracing::info!(
            "Channel {} to {}:{} is {:?}, rebuilding slot {}",
            current.id(),
            self.host,
            self.port,
            current.state(),
            index
        );
        let fresh = Arc::new(Channel::connect(&self.host, self.port, &self.options)?);
        *slot.write() = fresh.clone();
        self.rebuilt.fetch_add(1, Ordering::Relaxed);
        Ok(fresh)
    }

    /// Shuts every channel that is not already shut down. The pool builds no
    /// channels afterwards.
    pub fn shutdown(&self) {
        let _rebuilding = self.rebuild.lock();
        self.closed.store(true, Ordering::Release);
        for slot in &self.slots {
            let channel = slot.read().clone();
            if channel.is_usable() {
                channel.shutdown();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_at(&self, index: usize) -> Arc<Channel> {
        self.slots[index].read().clone()
    }
}
