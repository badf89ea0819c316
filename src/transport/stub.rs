//! RPC Stubs
//!
//! A stub binds one service to one channel in one calling style:
//! - **Blocking**: the calling thread waits for the reply.
//! - **Async**: the reply is handed to a callback.
//! - **Future**: the call runs as its own task and the caller awaits a handle.
//!
//! Which services exist is fixed at compile time by [`STUB_TABLE`]; asking
//! for any other name is an [`TransportError::UnknownService`].

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;

use super::channel::Channel;
use super::protocol;
use crate::error::TransportError;
use crate::heartbeat::types::{HEARTBEAT_METHOD, HEARTBEAT_SERVICE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFlavor {
    Blocking,
    Async,
    Future,
}

/// One callable service and its methods.
#[derive(Debug)]
pub struct StubEntry {
    pub service: &'static str,
    pub methods: &'static [&'static str],
}

pub static STUB_TABLE: &[StubEntry] = &[StubEntry {
    service: HEARTBEAT_SERVICE,
    methods: &[HEARTBEAT_METHOD],
}];

pub fn lookup(service: &str) -> Result<&'static StubEntry, TransportError> {
    STUB_TABLE
        .iter()
        .find(|entry| entry.service == service)
        .ok_or_else(|| TransportError::UnknownService(service.to_string()))
}

/// Typed client for one service.
pub trait RpcStub: Sized {
    const SERVICE_NAME: &'static str;

    fn from_stub(stub: ServiceStub) -> Self;
}

/// Untyped stub: service, calling style and channel.
#[derive(Clone)]
pub struct ServiceStub {
    entry: &'static StubEntry,
    flavor: StubFlavor,
    channel: Arc<Channel>,
    handle: Handle,
}

impl ServiceStub {
    /// Binds `service` to `channel`. Needs to run inside a tokio runtime,
    /// which is where non-blocking calls will be driven.
    pub fn new(service: &str, flavor: StubFlavor, channel: Arc<Channel>) -> Result<Self, TransportError> {
        let entry = lookup(service)?;
        let handle = Handle::try_current().map_err(|_| TransportError::NoRuntime("rpc stub"))?;

        Ok(Self {
            entry,
            flavor,
            channel,
            handle,
        })
    }

    pub fn service(&self) -> &'static str {
        self.entry.service
    }

    pub fn flavor(&self) -> StubFlavor {
        self.flavor
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    fn check_call(&self, flavor: StubFlavor, method: &str) -> Result<(), TransportError> {
        if self.flavor != flavor {
            return Err(TransportError::FlavorMismatch {
                service: self.entry.service.to_string(),
                expected: flavor,
                actual: self.flavor,
            });
        }
        if !self.entry.methods.iter().any(|known| *known == method) {
            return Err(TransportError::UnknownService(format!(
                "{}/{}",
                self.entry.service, method
            )));
        }
        Ok(())
    }

    fn prepare<Req, Resp>(
        &self,
        method: &'static str,
        request: &Req,
    ) -> Result<BoxFuture<'static, Result<Resp, TransportError>>, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let body = protocol::encode(request)?;
        let channel = self.channel.clone();
        let service = self.entry.service;

        Ok(async move {
            let bytes = channel.call_raw(service, method, body).await?;
            protocol::decode::<Resp>(&bytes)
        }
        .boxed())
    }

    /// Blocks the current thread until the reply arrives. On a multi-thread
    /// runtime worker the worker is handed off first; a current-thread
    /// runtime cannot block and the call is refused.
    pub fn call_blocking<Req, Resp>(&self, method: &'static str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.check_call(StubFlavor::Blocking, method)?;
        let call = self.prepare::<Req, Resp>(method, request)?;

        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| current.block_on(call))
            }
            Ok(_) => Err(TransportError::NoRuntime(
                "blocking rpc on a current-thread runtime",
            )),
            Err(_) => self.handle.block_on(call),
        }
    }

    /// Starts the call and passes its outcome to `callback`.
    pub fn call_async<Req, Resp, F>(&self, method: &'static str, request: &Req, callback: F) -> Result<(), TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Resp, TransportError>) + Send + 'static,
    {
        self.check_call(StubFlavor::Async, method)?;
        let call = self.prepare::<Req, Resp>(method, request)?;

        self.handle.spawn(async move { callback(call.await) });
        Ok(())
    }

    /// Starts the call as its own task. The call progresses whether or not
    /// the returned future is polled.
    pub fn call_future<Req, Resp>(&self, method: &'static str, request: &Req) -> Result<RpcFuture<Resp>, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.check_call(StubFlavor::Future, method)?;
        let call = self.prepare::<Req, Resp>(method, request)?;

        Ok(RpcFuture {
            task: self.handle.spawn(call),
        })
    }
}

impl std::fmt::Debug for ServiceStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStub")
            .field("service", &self.entry.service)
            .field("flavor", &self.flavor)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Pending reply of a [`StubFlavor::Future`] call. Dropping it does not
/// cancel the call; [`RpcFuture::cancel`] does.
pub struct RpcFuture<T> {
    task: JoinHandle<Result<T, TransportError>>,
}

impl<T> RpcFuture<T> {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for RpcFuture<T> {
    type Output = Result<T, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(TransportError::ChannelShutdown(format!("rpc task ended: {}", e))),
        })
    }
}
