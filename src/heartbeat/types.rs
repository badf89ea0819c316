use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::identity::NodeIdentity;
use crate::transport::{RpcFuture, RpcStub, ServiceStub};

pub const HEARTBEAT_SERVICE: &str = "heartbeat";
pub const HEARTBEAT_METHOD: &str = "report";

/// Liveness report sent by a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub sender: NodeIdentity,
    /// Sender's wall clock, in ms.
    pub report_time: u64,
}

/// Empty acknowledgment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {}

/// What the master keeps about the last report of one slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub sender: NodeIdentity,
    pub report_time: u64,
    /// Master's wall clock when the report arrived, in ms.
    pub received_at: u64,
}

/// Reacts to every heartbeat the master accepts.
pub trait HeartbeatListener: Send + Sync {
    fn on_heartbeat(&self, record: &HeartbeatRecord);
}

/// Client for the master's heartbeat service.
#[derive(Debug, Clone)]
pub struct HeartbeatStub {
    inner: ServiceStub,
}

impl RpcStub for HeartbeatStub {
    const SERVICE_NAME: &'static str = HEARTBEAT_SERVICE;

    fn from_stub(stub: ServiceStub) -> Self {
        Self { inner: stub }
    }
}

impl HeartbeatStub {
    /// Sends `request`; requires a future-flavored stub.
    pub fn report(&self, request: &HeartbeatRequest) -> Result<RpcFuture<HeartbeatResponse>, TransportError> {
        self.inner.call_future(HEARTBEAT_METHOD, request)
    }

    pub fn target(&self) -> &str {
        self.inner.channel().target()
    }
}
