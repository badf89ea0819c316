//! Transport Channel
//!
//! A channel is one HTTP/2 connection pool to a single `host:port`, built
//! with prior knowledge so calls multiplex over one connection. Channels are
//! cheap to share and are replaced, never repaired, once shut down.

use axum::body::Bytes;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::protocol::{self, CONTENT_TYPE};
use crate::config::RpcConfig;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Ready,
    /// No new calls; calls already in flight may still finish.
    Shutdown,
    /// Shut down with nothing in flight.
    Terminated,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Ready,
            1 => ChannelState::Shutdown,
            _ => ChannelState::Terminated,
        }
    }
}

/// Settings applied to every channel a pool builds.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub max_message_size: usize,
    pub flow_control_window: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&RpcConfig> for ChannelOptions {
    fn from(config: &RpcConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            flow_control_window: config.flow_control_window,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&RpcConfig::default())
    }
}

pub struct Channel {
    id: Uuid,
    target: String,
    client: reqwest::Client,
    max_message_size: usize,
    state: AtomicU8,
    in_flight: AtomicUsize,
}

impl Channel {
    /// Builds the channel. No connection is opened until the first call.
    pub fn connect(host: &str, port: u16, options: &ChannelOptions) -> Result<Self, TransportError> {
        let target = format!("http://{}:{}", host, port);
        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .http2_initial_stream_window_size(options.flow_control_window)
            .http2_initial_connection_window_size(options.flow_control_window)
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(|source| TransportError::ChannelBuild {
                target: target.clone(),
                source,
            })?;

        Ok(Self {
            id: Uuid::new_v4(),
            target,
            client,
            max_message_size: options.max_message_size,
            state: AtomicU8::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_usable(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stops accepting calls. Returns false if already shut down.
    pub fn shutdown(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.try_terminate();
        changed
    }

    fn try_terminate(&self) {
        if self.in_flight() == 0 {
            let _ = self
                .state
                .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Sends an encoded request and returns the raw response body.
    pub async fn call_raw(&self, service: &str, method: &str, body: Vec<u8>) -> Result<Bytes, TransportError> {
        if !self.is_usable() {
            return Err(TransportError::ChannelShutdown(self.target.clone()));
        }
        if body.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: body.len(),
                limit: self.max_message_size,
            });
        }

        let _call = InFlight::enter(self);
        let url = format!("{}{}", self.target, protocol::rpc_path(service, method));
        tracing::trace!("rpc call {} ({} bytes)", url, body.len());

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| TransportError::Request { url, source })?;
        if bytes.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                limit: self.max_message_size,
            });
        }
        Ok(bytes)
    }

    pub async fn call<Req, Resp>(&self, service: &str, method: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let body = protocol::encode(request)?;
        let bytes = self.call_raw(service, method, body).await?;
        protocol::decode(&bytes)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

struct InFlight<'a> {
    channel: &'a Channel,
}

impl<'a> InFlight<'a> {
    fn enter(channel: &'a Channel) -> Self {
        channel.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { channel }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.channel.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.channel.try_terminate();
    }
}
