//! Error taxonomy shared by every subsystem.
//!
//! Startup-time variants (`Configuration`, `ResourceExceeded`,
//! `DuplicateRegistration`, `InvalidIdentity`, `MasterUnavailable`) abort node
//! construction. `Transport` and `RpcTimeout` surface at RPC call sites and are
//! handled by the heartbeat retry policy. Task bodies themselves use
//! `anyhow::Result`; anything that escapes them is carried as `Fault`.

use std::time::Duration;

use crate::executor::types::ExecutorType;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{resource} would reach {requested}, exceeding the limit of {limit}")]
    ResourceExceeded {
        resource: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("duplicate {kind} registration: {name}")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("rpc did not complete within {0:?}")]
    RpcTimeout(Duration),

    #[error("invalid node identity: {0}")]
    InvalidIdentity(String),

    #[error("task rejected by {executor:?} pool: {reason}")]
    Rejected {
        executor: ExecutorType,
        reason: &'static str,
    },

    #[error("no master address available: {0}")]
    MasterUnavailable(String),

    #[error("unhandled fault: {0:#}")]
    Fault(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for errors the heartbeat retry path is expected to absorb.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RpcTimeout(_))
    }
}

/// Failures of channel or stub construction and of individual RPC calls.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build channel to {target}: {source}")]
    ChannelBuild {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("channel to {0} is shut down")]
    ChannelShutdown(String),

    #[error("no stub registered for service {0}")]
    UnknownService(String),

    #[error("stub for {service} was built as {actual:?}, call requires {expected:?}")]
    FlavorMismatch {
        service: String,
        expected: crate::transport::stub::StubFlavor,
        actual: crate::transport::stub::StubFlavor,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("message of {size} bytes exceeds the {limit} byte cap")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("failed to bind rpc endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no async runtime available for {0}")]
    NoRuntime(&'static str),
}
